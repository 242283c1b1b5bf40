//! Common traits for repositories and upstream fetchers
//!
//! Defines the storage and collection seams. Postgres and in-memory
//! implementations live in `billing-db`; the HTTP fetcher lives in
//! `billing-collector`.

use crate::error::AppError;
use crate::models::{
    BillableEvent, ConsolidatedMonth, EventKind, PricingConfig, RawEvent, RawEventFilter,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

/// Append-only raw event store
#[async_trait]
pub trait RawEventRepository: Send + Sync {
    /// Insert a batch atomically
    ///
    /// Fails with `InvalidEvent` or `DuplicateEvent` without inserting anything.
    async fn store_events(&self, events: &[RawEvent]) -> Result<usize, AppError>;

    /// Read events of one kind in insertion order (newest first when reversed)
    async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>, AppError>;

    /// Every event with `id <= max_id`, ordered by id
    async fn all_events(&self, max_id: i64) -> Result<Vec<RawEvent>, AppError>;

    /// Highest assigned id, `0` when empty
    async fn max_event_id(&self) -> Result<i64, AppError>;

    /// Check the store is reachable
    async fn ping(&self) -> Result<(), AppError>;
}

/// Installed pricing configuration
#[async_trait]
pub trait PricingConfigRepository: Send + Sync {
    /// Replace the installed configuration, returning the new version number
    async fn install(&self, config: &PricingConfig) -> Result<i64, AppError>;

    /// Currently installed configuration and its version
    async fn load(&self) -> Result<Option<(i64, PricingConfig)>, AppError>;
}

/// Frozen monthly billable events
#[async_trait]
pub trait ConsolidationRepository: Send + Sync {
    /// All consolidated months, oldest first
    async fn consolidated_months(&self) -> Result<Vec<ConsolidatedMonth>, AppError>;

    /// Whether `month` (first day) is consolidated
    async fn is_month_consolidated(&self, month: NaiveDate) -> Result<bool, AppError>;

    /// Freeze a month's rows in one transaction
    ///
    /// Fails with `Conflict` if the month is already consolidated.
    async fn store_month(
        &self,
        month: NaiveDate,
        raw_event_watermark: i64,
        rows: &[BillableEvent],
    ) -> Result<usize, AppError>;

    /// Frozen rows of a month, optionally restricted to organisations
    async fn get_month(
        &self,
        month: NaiveDate,
        org_guids: &[String],
    ) -> Result<Vec<BillableEvent>, AppError>;
}

/// Producer of raw event pages from an upstream API
#[async_trait]
pub trait EventFetcher: Send + Sync {
    /// Kind of events this fetcher produces
    fn kind(&self) -> EventKind;

    /// Next page of events strictly after `last_known`
    ///
    /// Returns `AppError::Cancelled` and no events if `cancel` fires first.
    async fn fetch_events(
        &self,
        cancel: &CancellationToken,
        last_known: Option<&RawEvent>,
    ) -> Result<Vec<RawEvent>, AppError>;
}
