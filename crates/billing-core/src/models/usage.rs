//! Usage event model
//!
//! A usage event is one contiguous, homogeneous segment of a resource's life
//! on a single plan. Usage events are derived from raw events and never stored
//! outside the consolidated tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::filter::TimeRange;

/// Stop time of an interval that has not been closed yet
pub const OPEN_END: DateTime<Utc> = DateTime::<Utc>::MAX_UTC;

/// Normalized usage interval `[event_start, event_stop)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_guid: String,
    pub event_start: DateTime<Utc>,
    pub event_stop: DateTime<Utc>,
    pub resource_guid: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub org_guid: String,
    #[serde(default)]
    pub space_guid: String,
    pub plan_guid: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub service_guid: Option<String>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub number_of_nodes: i64,
    #[serde(default)]
    pub memory_in_mb: i64,
    #[serde(default)]
    pub storage_in_mb: i64,

    /// Space display name, carried through to billable events
    #[serde(skip)]
    pub space_name: Option<String>,

    /// Insertion id of the raw event that opened the interval
    #[serde(skip)]
    pub sequence: i64,
}

impl UsageEvent {
    /// Whether the interval is still open
    pub fn is_open(&self) -> bool {
        self.event_stop == OPEN_END
    }

    /// Interval as a range
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.event_start,
            stop: self.event_stop,
        }
    }

    /// Copy of the event clipped to `range`, `None` if they do not intersect
    ///
    /// Open intervals are closed at the range's upper bound.
    pub fn clip(&self, range: &TimeRange) -> Option<UsageEvent> {
        let clipped = self.range().intersect(range)?;
        let mut event = self.clone();
        event.event_start = clipped.start;
        event.event_stop = clipped.stop;
        Some(event)
    }

    /// Duration in whole seconds
    pub fn duration_seconds(&self) -> i64 {
        (self.event_stop - self.event_start).num_seconds()
    }

    /// Deterministic ordering key: resource, start, insertion id, guid
    pub fn sort_key(&self) -> (&str, DateTime<Utc>, i64, &str) {
        (
            self.resource_guid.as_str(),
            self.event_start,
            self.sequence,
            self.event_guid.as_str(),
        )
    }
}

/// Sort usage-like rows into the canonical query order
pub fn sort_usage_events(events: &mut [UsageEvent]) {
    events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn usage(start: DateTime<Utc>, stop: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            event_guid: "e1".to_string(),
            event_start: start,
            event_stop: stop,
            resource_guid: "r1".to_string(),
            resource_name: "APP1".to_string(),
            resource_type: "app".to_string(),
            org_guid: "o1".to_string(),
            space_guid: "s1".to_string(),
            plan_guid: "p1".to_string(),
            plan_name: "app".to_string(),
            service_guid: None,
            service_name: None,
            number_of_nodes: 1,
            memory_in_mb: 512,
            storage_in_mb: 0,
            space_name: None,
            sequence: 1,
        }
    }

    #[test]
    fn test_clip_open_interval() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let open = usage(t0, OPEN_END);
        assert!(open.is_open());

        let range = TimeRange::new(t0, t0 + chrono::Duration::minutes(10)).unwrap();
        let clipped = open.clip(&range).unwrap();
        assert_eq!(clipped.duration_seconds(), 600);
        assert!(!clipped.is_open());
    }

    #[test]
    fn test_clip_disjoint() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = usage(t0, t0 + chrono::Duration::hours(1));
        let later = TimeRange::new(t0 + chrono::Duration::hours(1), t0 + chrono::Duration::hours(2))
            .unwrap();
        assert!(event.clip(&later).is_none());
    }

    #[test]
    fn test_internal_fields_not_serialized() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let json = serde_json::to_value(usage(t0, t0 + chrono::Duration::hours(1))).unwrap();
        assert!(json.get("sequence").is_none());
        assert!(json.get("space_name").is_none());
        assert_eq!(json["memory_in_mb"], 512);
    }
}
