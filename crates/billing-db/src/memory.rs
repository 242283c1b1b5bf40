//! In-memory repository implementations
//!
//! Behaviourally equivalent to the Postgres repositories and used by the
//! service and API test suites, and for running the engine without a
//! database.

use billing_core::{
    models::{
        sort_billable_events, BillableEvent, ConsolidatedMonth, PricingConfig, RawEvent,
        RawEventFilter,
    },
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::repositories::raw_event_repo::check_batch;

/// Raw event store backed by a vector in insertion order
#[derive(Default)]
pub struct InMemoryRawEventRepository {
    events: RwLock<Vec<RawEvent>>,
}

impl InMemoryRawEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl RawEventRepository for InMemoryRawEventRepository {
    async fn store_events(&self, events: &[RawEvent]) -> AppResult<usize> {
        check_batch(events)?;

        let mut stored = self.events.write();
        if let Some(existing) = events.iter().find(|event| {
            stored
                .iter()
                .any(|other| other.kind == event.kind && other.guid == event.guid)
        }) {
            return Err(AppError::DuplicateEvent {
                kind: existing.kind.to_string(),
                guid: existing.guid.clone(),
            });
        }

        let mut next_id = stored.last().map(|e| e.id).unwrap_or(0);
        for event in events {
            next_id += 1;
            let mut event = event.clone();
            event.id = next_id;
            stored.push(event);
        }
        Ok(events.len())
    }

    async fn get_events(&self, filter: &RawEventFilter) -> AppResult<Vec<RawEvent>> {
        let stored = self.events.read();
        let matching = stored.iter().filter(|e| e.kind == filter.kind);
        let limit = filter
            .limit
            .map(|l| l.max(0) as usize)
            .unwrap_or(usize::MAX);

        let events = if filter.reverse {
            matching.rev().take(limit).cloned().collect()
        } else {
            matching.take(limit).cloned().collect()
        };
        Ok(events)
    }

    async fn all_events(&self, max_id: i64) -> AppResult<Vec<RawEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.id <= max_id)
            .cloned()
            .collect())
    }

    async fn max_event_id(&self) -> AppResult<i64> {
        Ok(self.events.read().last().map(|e| e.id).unwrap_or(0))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Pricing configuration store keeping only the latest version
#[derive(Default)]
pub struct InMemoryPricingConfigRepository {
    installed: RwLock<Option<(i64, PricingConfig)>>,
}

impl InMemoryPricingConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PricingConfigRepository for InMemoryPricingConfigRepository {
    async fn install(&self, config: &PricingConfig) -> AppResult<i64> {
        let mut installed = self.installed.write();
        let version = installed.as_ref().map(|(v, _)| v + 1).unwrap_or(1);
        *installed = Some((version, config.clone()));
        Ok(version)
    }

    async fn load(&self) -> AppResult<Option<(i64, PricingConfig)>> {
        Ok(self.installed.read().clone())
    }
}

/// Frozen months keyed by month start
#[derive(Default)]
pub struct InMemoryConsolidationRepository {
    months: RwLock<BTreeMap<NaiveDate, (ConsolidatedMonth, Vec<BillableEvent>)>>,
}

impl InMemoryConsolidationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsolidationRepository for InMemoryConsolidationRepository {
    async fn consolidated_months(&self) -> AppResult<Vec<ConsolidatedMonth>> {
        Ok(self
            .months
            .read()
            .values()
            .map(|(month, _)| month.clone())
            .collect())
    }

    async fn is_month_consolidated(&self, month: NaiveDate) -> AppResult<bool> {
        Ok(self.months.read().contains_key(&month))
    }

    async fn store_month(
        &self,
        month: NaiveDate,
        raw_event_watermark: i64,
        rows: &[BillableEvent],
    ) -> AppResult<usize> {
        let mut months = self.months.write();
        if months.contains_key(&month) {
            return Err(AppError::Conflict(format!(
                "month {} is already consolidated",
                month
            )));
        }

        let mut frozen = rows.to_vec();
        sort_billable_events(&mut frozen);
        months.insert(
            month,
            (
                ConsolidatedMonth {
                    month,
                    raw_event_watermark,
                    consolidated_at: Utc::now(),
                },
                frozen,
            ),
        );
        Ok(rows.len())
    }

    async fn get_month(&self, month: NaiveDate, org_guids: &[String]) -> AppResult<Vec<BillableEvent>> {
        Ok(self
            .months
            .read()
            .get(&month)
            .map(|(_, rows)| {
                rows.iter()
                    .filter(|row| org_guids.is_empty() || org_guids.contains(&row.org_guid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
