//! Pricing configuration models
//!
//! Plans, VAT rates and currency rates are versioned by `valid_from`. Each
//! version is effective until the next version with the same key starts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use super::filter::parse_timestamp;

/// Currency every price is converted to before VAT
pub const BILLING_CURRENCY: &str = "GBP";

/// Allowed VAT codes
pub const VAT_CODES: [&str; 3] = ["Standard", "Reduced", "Zero"];

/// Allowed currency codes
pub const CURRENCY_CODES: [&str; 3] = ["GBP", "USD", "EUR"];

/// Deserialize a `valid_from` written as a date, RFC 3339 timestamp, or `epoch`
pub fn deserialize_valid_from<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// One priced line item of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlanComponent {
    /// Line item name (e.g. "compute")
    pub name: String,

    /// Arithmetic formula over the usage variables
    pub formula: String,

    /// Code of the VAT rate applied to this component
    pub vat_code: String,

    /// Currency the formula result is expressed in
    pub currency_code: String,
}

/// Versioned pricing plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlan {
    /// Plan identifier shared by all versions
    pub plan_guid: String,

    /// First instant this version applies (a month boundary)
    #[serde(deserialize_with = "deserialize_valid_from")]
    pub valid_from: DateTime<Utc>,

    /// Display name
    pub name: String,

    /// Default memory for resources on this plan
    #[serde(default)]
    pub memory_in_mb: i64,

    /// Default storage for resources on this plan
    #[serde(default)]
    pub storage_in_mb: i64,

    /// Default node count for resources on this plan
    #[serde(default)]
    pub number_of_nodes: i64,

    /// Priced components
    #[serde(default)]
    pub components: Vec<PricingPlanComponent>,
}

/// Versioned VAT rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRate {
    pub code: String,
    #[serde(deserialize_with = "deserialize_valid_from")]
    pub valid_from: DateTime<Utc>,
    pub rate: Decimal,
}

/// Versioned conversion rate into the billing currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRate {
    pub code: String,
    #[serde(deserialize_with = "deserialize_valid_from")]
    pub valid_from: DateTime<Utc>,
    pub rate: Decimal,
}

/// Complete pricing configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub vat_rates: Vec<VatRate>,

    #[serde(default)]
    pub currency_rates: Vec<CurrencyRate>,

    #[serde(default)]
    pub pricing_plans: Vec<PricingPlan>,

    /// Synthesise zero-cost placeholder plans instead of failing on missing plans
    #[serde(default)]
    pub ignore_missing_plans: bool,
}

impl PricingConfig {
    /// Parse a configuration document
    pub fn from_json(raw: &str) -> Result<Self, crate::AppError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Anything with a key and a `valid_from`, versioned over time
pub trait Versioned {
    /// Key shared by every version
    fn version_key(&self) -> &str;

    /// Start of this version
    fn valid_from(&self) -> DateTime<Utc>;
}

impl Versioned for PricingPlan {
    fn version_key(&self) -> &str {
        &self.plan_guid
    }

    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }
}

impl Versioned for VatRate {
    fn version_key(&self) -> &str {
        &self.code
    }

    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }
}

impl Versioned for CurrencyRate {
    fn version_key(&self) -> &str {
        &self.code
    }

    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }
}

/// Effective `[valid_from, valid_to)` of every version in `items`
///
/// `valid_to` is `None` for the latest version of each key.
pub fn effective_ranges<T: Versioned>(items: &[T]) -> Vec<(&T, Option<DateTime<Utc>>)> {
    items
        .iter()
        .map(|item| {
            let next = items
                .iter()
                .filter(|other| {
                    other.version_key() == item.version_key()
                        && other.valid_from() > item.valid_from()
                })
                .map(Versioned::valid_from)
                .min();
            (item, next)
        })
        .collect()
}
