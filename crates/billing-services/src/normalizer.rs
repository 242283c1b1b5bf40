//! Raw events to usage intervals
//!
//! Replays raw events in `(created_at, id)` order through a per-resource
//! state machine. Every interval is half-open; intervals that are still
//! running end at `OPEN_END` and are clipped by the query range later.

use billing_core::models::{sort_usage_events, EventKind, RawEvent, UsageEvent, OPEN_END};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::constants::{
    COMPUTE_PLAN_GUID, COMPUTE_SERVICE_GUID, MB_PER_GB, STAGING_PLAN_GUID, TASK_PLAN_GUID,
};

const MANAGED_SERVICE_INSTANCE: &str = "managed_service_instance";
const SCALE_MEMBERS_EVENT: &str = "deployment.scale.members";

/// Treat an explicit `null` like a missing key
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppPayload {
    #[serde(deserialize_with = "nullable")]
    state: String,
    #[serde(deserialize_with = "nullable")]
    app_guid: String,
    #[serde(deserialize_with = "nullable")]
    app_name: String,
    #[serde(deserialize_with = "nullable")]
    parent_app_guid: String,
    #[serde(deserialize_with = "nullable")]
    parent_app_name: String,
    #[serde(deserialize_with = "nullable")]
    task_guid: String,
    #[serde(deserialize_with = "nullable")]
    task_name: String,
    #[serde(deserialize_with = "nullable")]
    org_guid: String,
    #[serde(deserialize_with = "nullable")]
    space_guid: String,
    space_name: Option<String>,
    #[serde(deserialize_with = "nullable")]
    instance_count: i64,
    #[serde(deserialize_with = "nullable")]
    memory_in_mb_per_instance: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServicePayload {
    #[serde(deserialize_with = "nullable")]
    state: String,
    #[serde(deserialize_with = "nullable")]
    service_instance_guid: String,
    #[serde(deserialize_with = "nullable")]
    service_instance_name: String,
    #[serde(deserialize_with = "nullable")]
    service_instance_type: String,
    #[serde(deserialize_with = "nullable")]
    service_plan_guid: String,
    #[serde(deserialize_with = "nullable")]
    service_plan_name: String,
    #[serde(deserialize_with = "nullable")]
    service_guid: String,
    #[serde(deserialize_with = "nullable")]
    service_label: String,
    #[serde(deserialize_with = "nullable")]
    org_guid: String,
    #[serde(deserialize_with = "nullable")]
    space_guid: String,
    space_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScalePayload {
    #[serde(deserialize_with = "nullable")]
    event: String,
    #[serde(deserialize_with = "nullable")]
    data: ScaleData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScaleData {
    #[serde(deserialize_with = "nullable")]
    deployment: String,
    memory: Option<String>,
    storage: Option<String>,
}

/// Deterministic guid derived from a raw event guid
fn derived_guid(raw_guid: &str, discriminator: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}/{}", raw_guid, discriminator).as_bytes(),
    )
    .to_string()
}

/// Parse a size such as `"2 GB"` or `"512 MB"` into megabytes
fn parse_size_mb(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    match unit.trim().to_ascii_uppercase().as_str() {
        "GB" => amount.checked_mul(MB_PER_GB),
        "MB" | "" => Some(amount),
        _ => None,
    }
}

/// Service instance guid at the end of a `<prefix>-<guid>` deployment name
fn deployment_instance_guid(deployment: &str) -> Option<String> {
    let start = deployment.len().checked_sub(36)?;
    let (prefix, guid) = deployment.split_at(start);
    if !prefix.ends_with('-') {
        return None;
    }
    Uuid::parse_str(guid).ok().map(|g| g.to_string())
}

/// Replay state: output intervals plus indices of the ones still open
struct Normalizer {
    intervals: Vec<UsageEvent>,
    apps: HashMap<String, Vec<usize>>,
    staging: HashMap<String, usize>,
    tasks: HashMap<String, usize>,
    services: HashMap<String, usize>,
    seen_services: HashSet<String>,
    collection_epoch: DateTime<Utc>,
}

impl Normalizer {
    fn new(collection_epoch: DateTime<Utc>) -> Self {
        Self {
            intervals: Vec::new(),
            apps: HashMap::new(),
            staging: HashMap::new(),
            tasks: HashMap::new(),
            services: HashMap::new(),
            seen_services: HashSet::new(),
            collection_epoch,
        }
    }

    fn open(&mut self, event: UsageEvent) -> usize {
        self.intervals.push(event);
        self.intervals.len() - 1
    }

    fn close(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(interval) = self.intervals.get_mut(index) {
            interval.event_stop = at;
        }
    }

    fn apply(&mut self, event: &RawEvent) {
        match event.kind {
            EventKind::App => match serde_json::from_value::<AppPayload>(event.payload.clone()) {
                Ok(payload) => self.apply_app(event, payload),
                Err(e) => warn!(guid = %event.guid, "Skipping malformed app event: {}", e),
            },
            EventKind::Service => {
                match serde_json::from_value::<ServicePayload>(event.payload.clone()) {
                    Ok(payload) => self.apply_service(event, payload),
                    Err(e) => warn!(guid = %event.guid, "Skipping malformed service event: {}", e),
                }
            }
            EventKind::ManagedMetric => {
                match serde_json::from_value::<ScalePayload>(event.payload.clone()) {
                    Ok(payload) => self.apply_scale(event, payload),
                    Err(e) => warn!(guid = %event.guid, "Skipping malformed metric event: {}", e),
                }
            }
        }
    }

    fn apply_app(&mut self, event: &RawEvent, payload: AppPayload) {
        let at = event.created_at;
        match payload.state.as_str() {
            // Every STARTED closes the app's open instances at `at` and opens
            // `instance_count` new ones from `at`, so a scale from 1 to 2
            // instances at T+30m yields [T, T+30m) plus two intervals from T+30m.
            "STARTED" => {
                self.close_app(&payload.app_guid, at);
                let mut open = Vec::new();
                for instance in 0..payload.instance_count.max(0) {
                    let event_guid = if instance == 0 {
                        event.guid.clone()
                    } else {
                        derived_guid(&event.guid, &instance.to_string())
                    };
                    let interval = UsageEvent {
                        event_guid,
                        event_start: at,
                        event_stop: OPEN_END,
                        resource_guid: payload.app_guid.clone(),
                        resource_name: payload.app_name.clone(),
                        resource_type: "app".to_string(),
                        org_guid: payload.org_guid.clone(),
                        space_guid: payload.space_guid.clone(),
                        plan_guid: COMPUTE_PLAN_GUID.to_string(),
                        plan_name: "app".to_string(),
                        service_guid: Some(COMPUTE_SERVICE_GUID.to_string()),
                        service_name: Some("app".to_string()),
                        number_of_nodes: 1,
                        memory_in_mb: payload.memory_in_mb_per_instance,
                        storage_in_mb: 0,
                        space_name: payload.space_name.clone(),
                        sequence: event.id,
                    };
                    open.push(self.open(interval));
                }
                self.apps.insert(payload.app_guid, open);
            }
            "STOPPED" => self.close_app(&payload.app_guid, at),
            "STAGING_STARTED" => {
                if let Some(index) = self.staging.remove(&payload.parent_app_guid) {
                    self.close(index, at);
                }
                let interval = UsageEvent {
                    event_guid: event.guid.clone(),
                    event_start: at,
                    event_stop: OPEN_END,
                    resource_guid: payload.parent_app_guid.clone(),
                    resource_name: payload.parent_app_name.clone(),
                    resource_type: "app".to_string(),
                    org_guid: payload.org_guid,
                    space_guid: payload.space_guid,
                    plan_guid: STAGING_PLAN_GUID.to_string(),
                    plan_name: "staging".to_string(),
                    service_guid: Some(COMPUTE_SERVICE_GUID.to_string()),
                    service_name: Some("app".to_string()),
                    number_of_nodes: 1,
                    memory_in_mb: payload.memory_in_mb_per_instance,
                    storage_in_mb: 0,
                    space_name: payload.space_name,
                    sequence: event.id,
                };
                let index = self.open(interval);
                self.staging.insert(payload.parent_app_guid, index);
            }
            "STAGING_STOPPED" => {
                if let Some(index) = self.staging.remove(&payload.parent_app_guid) {
                    self.close(index, at);
                }
            }
            "TASK_STARTED" => {
                if let Some(index) = self.tasks.remove(&payload.task_guid) {
                    self.close(index, at);
                }
                let interval = UsageEvent {
                    event_guid: event.guid.clone(),
                    event_start: at,
                    event_stop: OPEN_END,
                    resource_guid: payload.task_guid.clone(),
                    resource_name: payload.task_name,
                    resource_type: "task".to_string(),
                    org_guid: payload.org_guid,
                    space_guid: payload.space_guid,
                    plan_guid: TASK_PLAN_GUID.to_string(),
                    plan_name: "task".to_string(),
                    service_guid: Some(COMPUTE_SERVICE_GUID.to_string()),
                    service_name: Some("app".to_string()),
                    number_of_nodes: 1,
                    memory_in_mb: payload.memory_in_mb_per_instance,
                    storage_in_mb: 0,
                    space_name: payload.space_name,
                    sequence: event.id,
                };
                let index = self.open(interval);
                self.tasks.insert(payload.task_guid, index);
            }
            "TASK_STOPPED" => {
                if let Some(index) = self.tasks.remove(&payload.task_guid) {
                    self.close(index, at);
                }
            }
            other => debug!(guid = %event.guid, state = other, "Ignoring app state"),
        }
    }

    fn close_app(&mut self, app_guid: &str, at: DateTime<Utc>) {
        for index in self.apps.remove(app_guid).unwrap_or_default() {
            self.close(index, at);
        }
    }

    fn apply_service(&mut self, event: &RawEvent, payload: ServicePayload) {
        if payload.service_instance_type != MANAGED_SERVICE_INSTANCE {
            return;
        }

        let at = event.created_at;
        let first_seen = self
            .seen_services
            .insert(payload.service_instance_guid.clone());
        if let Some(index) = self.services.remove(&payload.service_instance_guid) {
            self.close(index, at);
        }

        let (event_guid, start) = match payload.state.as_str() {
            "CREATED" | "UPDATED" => (event.guid.clone(), at),
            "DELETED" if first_seen => {
                debug!(guid = %event.guid, "Back-filling creation of deleted service instance");
                (derived_guid(&event.guid, "created"), self.collection_epoch)
            }
            "DELETED" => return,
            other => {
                debug!(guid = %event.guid, state = other, "Ignoring service state");
                return;
            }
        };

        let interval = UsageEvent {
            event_guid,
            event_start: start,
            event_stop: OPEN_END,
            resource_guid: payload.service_instance_guid.clone(),
            resource_name: payload.service_instance_name,
            resource_type: payload.service_label.clone(),
            org_guid: payload.org_guid,
            space_guid: payload.space_guid,
            plan_guid: payload.service_plan_guid,
            plan_name: payload.service_plan_name,
            service_guid: Some(payload.service_guid),
            service_name: Some(payload.service_label),
            number_of_nodes: 0,
            memory_in_mb: 0,
            storage_in_mb: 0,
            space_name: payload.space_name,
            sequence: event.id,
        };
        let index = self.open(interval);

        if payload.state == "DELETED" {
            self.close(index, at);
        } else {
            self.services.insert(payload.service_instance_guid, index);
        }
    }

    fn apply_scale(&mut self, event: &RawEvent, payload: ScalePayload) {
        if payload.event != SCALE_MEMBERS_EVENT {
            return;
        }
        let Some(instance_guid) = deployment_instance_guid(&payload.data.deployment) else {
            warn!(guid = %event.guid, deployment = %payload.data.deployment, "Unrecognised deployment name");
            return;
        };
        let Some(index) = self.services.get(&instance_guid).copied() else {
            debug!(guid = %event.guid, "No running service instance to rescale");
            return;
        };

        let at = event.created_at;
        let Some(current) = self.intervals.get(index).cloned() else {
            return;
        };
        self.close(index, at);

        let mut next = current;
        next.event_guid = derived_guid(&event.guid, &instance_guid);
        next.event_start = at;
        next.event_stop = OPEN_END;
        next.sequence = event.id;
        if let Some(mb) = payload.data.memory.as_deref().and_then(parse_size_mb) {
            next.memory_in_mb = mb;
        }
        if let Some(mb) = payload.data.storage.as_deref().and_then(parse_size_mb) {
            next.storage_in_mb = mb;
        }

        let index = self.open(next);
        self.services.insert(instance_guid, index);
    }

    fn finish(self) -> Vec<UsageEvent> {
        let mut intervals: Vec<UsageEvent> = self
            .intervals
            .into_iter()
            .filter(|e| e.event_start < e.event_stop)
            .collect();
        sort_usage_events(&mut intervals);
        intervals
    }
}

/// Turn raw events into usage intervals
///
/// Events are replayed in `(created_at, id)` order. Malformed payloads are
/// logged and skipped. A service instance whose first observed event is a
/// deletion is assumed to have existed since the earliest stored event.
#[instrument(skip(events), fields(events = events.len()))]
pub fn normalize(events: &[RawEvent]) -> Vec<UsageEvent> {
    let mut ordered: Vec<&RawEvent> = events.iter().collect();
    ordered.sort_by_key(|e| (e.created_at, e.id));

    let collection_epoch = ordered
        .first()
        .map(|e| e.created_at)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let mut normalizer = Normalizer::new(collection_epoch);
    for event in ordered {
        normalizer.apply(event);
    }
    let intervals = normalizer.finish();
    debug!("Normalized {} usage intervals", intervals.len());
    intervals
}
