//! Query filters and calendar-month helpers
//!
//! Every query takes a half-open `[range_start, range_stop)` window. Months
//! are the unit of consolidation, so ranges are frequently truncated and
//! split at month boundaries.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Literal accepted in configuration documents for the start of time
pub const EPOCH_LITERAL: &str = "epoch";

/// Parse a timestamp given as `YYYY-MM-DD`, RFC 3339, or `epoch`
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation("timestamp is empty".to_string()));
    }
    if value.eq_ignore_ascii_case(EPOCH_LITERAL) || value == "-infinity" {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN)));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%MZ") {
        return Ok(Utc.from_utc_datetime(&ts));
    }
    Err(AppError::Validation(format!(
        "invalid timestamp '{value}': expected YYYY-MM-DD or RFC 3339"
    )))
}

/// First instant of the month containing `ts`
pub fn truncate_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    month_start(ts.date_naive())
}

/// First instant of the month containing `date`
pub fn month_start(date: NaiveDate) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
    Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN))
}

/// First instant of the month after the one containing `ts`
pub fn next_month(ts: DateTime<Utc>) -> DateTime<Utc> {
    let date = ts.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date);
    Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN))
}

/// Whether `ts` is exactly `YYYY-MM-01T00:00:00Z`
pub fn is_month_boundary(ts: DateTime<Utc>) -> bool {
    truncate_month(ts) == ts
}

/// Month key (`YYYY-MM-01`) of the month containing `ts`
pub fn month_key(ts: DateTime<Utc>) -> NaiveDate {
    truncate_month(ts).date_naive()
}

/// Half-open time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range, rejecting empty or reversed windows
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<Self, AppError> {
        if start >= stop {
            return Err(AppError::Validation(
                "range_start must be before range_stop".to_string(),
            ));
        }
        Ok(Self { start, stop })
    }

    /// Whole calendar month starting at `month`
    pub fn month(month: NaiveDate) -> Self {
        let start = month_start(month);
        Self {
            start,
            stop: next_month(start),
        }
    }

    /// Intersection of two ranges, `None` when disjoint
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let stop = self.stop.min(other.stop);
        (start < stop).then_some(TimeRange { start, stop })
    }

    /// Whether both ends sit on month boundaries
    pub fn is_whole_months(&self) -> bool {
        is_month_boundary(self.start) && is_month_boundary(self.stop)
    }

    /// Split the range at month boundaries
    ///
    /// An empty or reversed range yields no pieces.
    pub fn split_by_month(&self) -> Vec<TimeRange> {
        let mut pieces = Vec::new();
        let mut cursor = self.start;
        while cursor < self.stop {
            let boundary = next_month(cursor).min(self.stop);
            pieces.push(TimeRange {
                start: cursor,
                stop: boundary,
            });
            cursor = boundary;
        }
        pieces
    }

    /// Month keys of every month intersecting the range
    pub fn months(&self) -> Vec<NaiveDate> {
        self.split_by_month()
            .into_iter()
            .map(|piece| month_key(piece.start))
            .collect()
    }
}

/// Filter accepted by every usage/billable query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub range_start: DateTime<Utc>,
    pub range_stop: DateTime<Utc>,
    #[serde(default)]
    pub org_guids: Vec<String>,
}

impl EventFilter {
    /// Build a filter from raw query strings
    pub fn parse(
        range_start: Option<&str>,
        range_stop: Option<&str>,
        org_guids: Vec<String>,
    ) -> Result<Self, AppError> {
        let start = range_start
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AppError::MissingField("range_start".to_string()))?;
        let stop = range_stop
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AppError::MissingField("range_stop".to_string()))?;

        let filter = Self {
            range_start: parse_timestamp(start)?,
            range_stop: parse_timestamp(stop)?,
            org_guids,
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Create a filter over an already-parsed range
    pub fn new(range: TimeRange, org_guids: Vec<String>) -> Self {
        Self {
            range_start: range.start,
            range_stop: range.stop,
            org_guids,
        }
    }

    /// Check the range is well formed
    pub fn validate(&self) -> Result<(), AppError> {
        TimeRange::new(self.range_start, self.range_stop).map(|_| ())
    }

    /// The filter's time window
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.range_start,
            stop: self.range_stop,
        }
    }

    /// Whether an organisation passes the filter (no orgs = all orgs)
    pub fn matches_org(&self, org_guid: &str) -> bool {
        self.org_guids.is_empty() || self.org_guids.iter().any(|o| o == org_guid)
    }

    /// Split into one filter per calendar month
    pub fn split_by_month(&self) -> Vec<EventFilter> {
        self.range()
            .split_by_month()
            .into_iter()
            .map(|range| EventFilter::new(range, self.org_guids.clone()))
            .collect()
    }
}
