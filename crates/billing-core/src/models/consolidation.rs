//! Consolidation history model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A month whose billable events have been frozen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedMonth {
    /// First day of the month
    pub month: NaiveDate,

    /// Highest raw-event id visible when the month was frozen
    pub raw_event_watermark: i64,

    /// When the month was frozen
    pub consolidated_at: DateTime<Utc>,
}
