//! Raw lifecycle event model
//!
//! Raw events are the immutable audit record fetched from the upstream
//! platform APIs. Their payload is kept verbatim; interpretation happens in
//! the normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Source of a raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum EventKind {
    /// Application lifecycle (start, stop, scale, staging)
    #[serde(rename = "app")]
    App,

    /// Service instance lifecycle (create, update, delete)
    #[serde(rename = "service")]
    Service,

    /// Managed-service scaling audits
    #[serde(rename = "managed-metric")]
    ManagedMetric,
}

impl EventKind {
    /// All kinds, in collection order
    pub const ALL: [EventKind; 3] = [EventKind::App, EventKind::Service, EventKind::ManagedMetric];

    /// Storage label
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::App => "app",
            EventKind::Service => "service",
            EventKind::ManagedMetric => "managed-metric",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(EventKind::App),
            "service" => Ok(EventKind::Service),
            "managed-metric" => Ok(EventKind::ManagedMetric),
            other => Err(AppError::InvalidEvent(format!("unknown event kind: {other}"))),
        }
    }
}

/// Raw event entity
///
/// `id` is assigned by the store on insert and is `0` for events that have
/// not been persisted yet (e.g. fresh from a fetcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Store-assigned insertion sequence
    #[serde(default)]
    pub id: i64,

    /// Upstream event identifier
    pub guid: String,

    /// Event source
    pub kind: EventKind,

    /// Upstream creation time
    pub created_at: DateTime<Utc>,

    /// Opaque upstream payload
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Create an unsaved raw event
    pub fn new(
        guid: impl Into<String>,
        kind: EventKind,
        created_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: 0,
            guid: guid.into(),
            kind,
            created_at,
            payload,
        }
    }

    /// Check the event carries everything the store requires
    pub fn validate(&self) -> Result<(), AppError> {
        if self.guid.trim().is_empty() {
            return Err(AppError::InvalidEvent("event guid is required".to_string()));
        }
        if self.created_at.timestamp() == 0 {
            return Err(AppError::InvalidEvent(format!(
                "event {} has no created_at",
                self.guid
            )));
        }
        let empty_payload = match &self.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        };
        if empty_payload {
            return Err(AppError::InvalidEvent(format!(
                "event {} has an empty payload",
                self.guid
            )));
        }
        Ok(())
    }
}

/// Filter for reading raw events back out of the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventFilter {
    /// Kind to read (required)
    pub kind: EventKind,

    /// Maximum number of events (None = unbounded)
    pub limit: Option<i64>,

    /// Newest first when true
    pub reverse: bool,
}

impl RawEventFilter {
    /// Filter returning only the most recently inserted event of a kind
    pub fn latest(kind: EventKind) -> Self {
        Self {
            kind,
            limit: Some(1),
            reverse: true,
        }
    }

    /// Filter returning every event of a kind, oldest first
    pub fn all(kind: EventKind) -> Self {
        Self {
            kind,
            limit: None,
            reverse: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(guid: &str, payload: serde_json::Value) -> RawEvent {
        RawEvent::new(
            guid,
            EventKind::App,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            payload,
        )
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("compose".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_kind_serde_labels() {
        let json = serde_json::to_string(&EventKind::ManagedMetric).unwrap();
        assert_eq!(json, "\"managed-metric\"");
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(event("", json!({"state": "STARTED"})).validate().is_err());
        assert!(event("g1", serde_json::Value::Null).validate().is_err());
        assert!(event("g1", json!({})).validate().is_err());

        let mut no_time = event("g1", json!({"state": "STARTED"}));
        no_time.created_at = Utc.timestamp_opt(0, 0).unwrap();
        assert!(no_time.validate().is_err());

        assert!(event("g1", json!({"state": "STARTED"})).validate().is_ok());
    }
}
