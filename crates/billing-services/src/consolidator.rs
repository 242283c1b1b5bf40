//! Monthly consolidation
//!
//! Once a calendar month has ended its billable events are priced one last
//! time and frozen together with the raw-event watermark they were derived
//! from. Frozen months are never rewritten.

use billing_core::{
    models::{month_key, month_start, truncate_month, EventFilter, TimeRange},
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppError, AppResult,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::constants::CONSOLIDATION_DELAY_DAYS;
use crate::engine::BillingEngine;

/// Freezes closed months
pub struct Consolidator<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    engine: Arc<BillingEngine<E, P, C>>,
    start_date: NaiveDate,
}

impl<E, P, C> Consolidator<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    /// Create a consolidator that never looks before `start_date`
    pub fn new(engine: Arc<BillingEngine<E, P, C>>, start_date: NaiveDate) -> Self {
        Self {
            engine,
            start_date: month_key(month_start(start_date)),
        }
    }

    /// Whether every month intersecting the filter's range is frozen
    #[instrument(skip(self))]
    pub async fn is_range_consolidated(&self, filter: &EventFilter) -> AppResult<bool> {
        filter.validate()?;
        for month in filter.range().months() {
            if !self.engine.consolidation().is_month_consolidated(month).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Freeze one month
    ///
    /// Returns the number of rows written, or `None` when the month was
    /// already consolidated.
    #[instrument(skip(self))]
    pub async fn consolidate_month(&self, month: NaiveDate) -> AppResult<Option<usize>> {
        self.consolidate_month_at(month, Utc::now()).await
    }

    async fn consolidate_month_at(
        &self,
        month: NaiveDate,
        now: DateTime<Utc>,
    ) -> AppResult<Option<usize>> {
        let range = TimeRange::month(month);
        if range.start.date_naive() != month {
            return Err(AppError::Validation(format!(
                "{} is not the first day of a month",
                month
            )));
        }
        if range.stop > now {
            return Err(AppError::MonthNotClosed(format!(
                "month {} is not closed",
                month
            )));
        }

        let _guard = self.engine.lock_pricing().await;
        let repo = self.engine.consolidation();
        if repo.is_month_consolidated(month).await? {
            debug!("Month {} already consolidated", month);
            return Ok(None);
        }

        let watermark = self.engine.max_event_id().await?;
        let rows = self.engine.billable_at(range, watermark).await?;
        match repo.store_month(month, watermark, &rows).await {
            Ok(written) => {
                info!(
                    "Consolidated {} with {} rows at watermark {}",
                    month, written, watermark
                );
                Ok(Some(written))
            }
            Err(AppError::Conflict(_)) => {
                warn!("Month {} was consolidated concurrently", month);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Freeze every closed, unconsolidated month intersecting `[start, stop)`
    #[instrument(skip(self))]
    pub async fn consolidate_full_months(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> AppResult<Vec<NaiveDate>> {
        self.consolidate_full_months_at(start, stop, Utc::now()).await
    }

    async fn consolidate_full_months_at(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<NaiveDate>> {
        let mut consolidated = Vec::new();
        if start >= stop {
            return Ok(consolidated);
        }

        let range = TimeRange {
            start: truncate_month(start),
            stop,
        };
        for month in range.months() {
            if TimeRange::month(month).stop > now {
                break;
            }
            if self.consolidate_month_at(month, now).await?.is_some() {
                consolidated.push(month);
            }
        }
        Ok(consolidated)
    }

    /// Freeze every month from the start date up to the last settled month
    ///
    /// A month is settled once `CONSOLIDATION_DELAY_DAYS` have passed since
    /// it ended.
    #[instrument(skip(self))]
    pub async fn consolidate_all(&self) -> AppResult<Vec<NaiveDate>> {
        let now = Utc::now();
        let settled = truncate_month(now - Duration::days(CONSOLIDATION_DELAY_DAYS));
        let start = TimeRange::month(self.start_date).start;
        self.consolidate_full_months_at(start, settled, now).await
    }

    /// Run `consolidate_all` every `interval` until cancelled
    pub async fn run(&self, interval: std::time::Duration, cancel: CancellationToken) {
        info!("Consolidator started, interval {:?}", interval);
        loop {
            match self.consolidate_all().await {
                Ok(months) if !months.is_empty() => {
                    info!("Consolidated {} months", months.len())
                }
                Ok(_) => debug!("Nothing to consolidate"),
                Err(e) => error!("Consolidation failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Consolidator stopped");
    }
}
