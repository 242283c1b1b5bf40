//! Billable event model
//!
//! A billable event is a usage event enriched with its price breakdown.
//! Monetary values serialise as decimal strings.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::usage::UsageEvent;

/// Price of one partition of a usage interval under one plan component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceComponent {
    pub name: String,
    pub plan_name: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub vat_rate: Decimal,
    pub vat_code: String,
    pub currency_code: String,
    pub currency_rate: Decimal,
    pub inc_vat: Decimal,
    pub ex_vat: Decimal,
}

/// Total price with per-partition details
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Price {
    pub inc_vat: Decimal,
    pub ex_vat: Decimal,
    pub details: Vec<PriceComponent>,
}

impl Price {
    /// Build a price whose totals are the sums of its details
    pub fn from_details(details: Vec<PriceComponent>) -> Self {
        let ex_vat = details.iter().map(|d| d.ex_vat).sum::<Decimal>().normalize();
        let inc_vat = details.iter().map(|d| d.inc_vat).sum::<Decimal>().normalize();
        Self {
            inc_vat,
            ex_vat,
            details,
        }
    }
}

/// Priced usage event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillableEvent {
    pub event_guid: String,
    pub event_start: DateTime<Utc>,
    pub event_stop: DateTime<Utc>,
    pub resource_guid: String,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: String,
    pub space_guid: String,
    #[serde(default)]
    pub space_name: Option<String>,
    pub plan_guid: String,
    pub plan_name: String,
    #[serde(default)]
    pub service_guid: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    pub number_of_nodes: i64,
    pub memory_in_mb: i64,
    pub storage_in_mb: i64,
    pub price: Price,

    /// Insertion id of the raw event that opened the interval
    #[serde(skip)]
    pub sequence: i64,
}

impl BillableEvent {
    /// Attach a price to a (clipped) usage event
    pub fn from_usage(usage: UsageEvent, price: Price) -> Self {
        Self {
            event_guid: usage.event_guid,
            event_start: usage.event_start,
            event_stop: usage.event_stop,
            resource_guid: usage.resource_guid,
            resource_name: usage.resource_name,
            resource_type: usage.resource_type,
            org_guid: usage.org_guid,
            space_guid: usage.space_guid,
            space_name: usage.space_name,
            plan_guid: usage.plan_guid,
            plan_name: usage.plan_name,
            service_guid: usage.service_guid,
            service_name: usage.service_name,
            number_of_nodes: usage.number_of_nodes,
            memory_in_mb: usage.memory_in_mb,
            storage_in_mb: usage.storage_in_mb,
            price,
            sequence: usage.sequence,
        }
    }

    /// Canonical ordering key, matching usage events
    pub fn sort_key(&self) -> (&str, DateTime<Utc>, i64, &str) {
        (
            self.resource_guid.as_str(),
            self.event_start,
            self.sequence,
            self.event_guid.as_str(),
        )
    }
}

/// Sort billable rows into the canonical query order
pub fn sort_billable_events(events: &mut [BillableEvent]) {
    events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// Ex-VAT cost total for one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalCost {
    pub plan_guid: String,
    pub cost: Decimal,
}
