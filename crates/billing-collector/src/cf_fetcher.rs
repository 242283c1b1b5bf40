//! Cloud Foundry usage-event fetcher
//!
//! Pages through `/v2/{app,service}_usage_events` with an `after_guid`
//! cursor. Events are returned in upstream order; anything younger than the
//! configured minimum age is held back (together with every event after it)
//! so that late writes upstream never leave a gap behind the cursor.

use async_trait::async_trait;
use billing_core::{
    config::{CollectorConfig, UpstreamConfig},
    models::{EventKind, RawEvent},
    traits::EventFetcher,
    AppError, AppResult,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

/// Largest page the upstream serves
pub const MAX_FETCH_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct UsageEventList {
    #[serde(default)]
    resources: Vec<UsageEventResource>,
}

#[derive(Debug, Deserialize)]
struct UsageEventResource {
    metadata: UsageEventMetadata,
    entity: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UsageEventMetadata {
    guid: String,
    created_at: DateTime<Utc>,
}

/// Fetcher for one Cloud Foundry usage-event kind
pub struct CfEventFetcher {
    kind: EventKind,
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    fetch_limit: u32,
    record_min_age: Duration,
}

impl CfEventFetcher {
    /// Create a fetcher
    ///
    /// Only app and service usage events are served by this API.
    pub fn new(
        kind: EventKind,
        api_url: impl Into<String>,
        token: Option<String>,
        fetch_limit: u32,
        record_min_age: std::time::Duration,
        request_timeout: std::time::Duration,
    ) -> AppResult<Self> {
        if kind == EventKind::ManagedMetric {
            return Err(AppError::Config(format!(
                "no Cloud Foundry usage-event API for '{}' events",
                kind
            )));
        }
        if fetch_limit == 0 || fetch_limit > MAX_FETCH_LIMIT {
            return Err(AppError::Config(format!(
                "fetch limit must be between 1 and {}, got {}",
                MAX_FETCH_LIMIT, fetch_limit
            )));
        }
        let record_min_age = Duration::from_std(record_min_age)
            .map_err(|e| AppError::Config(format!("invalid record minimum age: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            kind,
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            fetch_limit,
            record_min_age,
        })
    }

    /// Create a fetcher from the application configuration
    pub fn from_config(
        kind: EventKind,
        upstream: &UpstreamConfig,
        collector: &CollectorConfig,
    ) -> AppResult<Self> {
        Self::new(
            kind,
            upstream.api_url.clone(),
            upstream.token.clone(),
            collector.fetch_limit,
            collector.record_min_age(),
            std::time::Duration::from_secs(upstream.request_timeout_secs),
        )
    }

    fn request(&self, last_known: Option<&RawEvent>) -> reqwest::RequestBuilder {
        let url = format!("{}/v2/{}_usage_events", self.api_url, self.kind);
        let mut query = vec![("results-per-page", self.fetch_limit.to_string())];
        if let Some(event) = last_known {
            query.push(("after_guid", event.guid.clone()));
        }

        let request = self.client.get(url).query(&query);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_page(&self, last_known: Option<&RawEvent>) -> AppResult<UsageEventList> {
        let response = self.request(last_known).send().await.map_err(|e| {
            error!("{} usage events request failed: {}", self.kind, e);
            AppError::Upstream(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("{} usage events request returned {}: {}", self.kind, status, body);
            return Err(AppError::Upstream(format!("{} {}", status, body)));
        }

        response.json::<UsageEventList>().await.map_err(|e| {
            error!("Invalid {} usage events response: {}", self.kind, e);
            AppError::Upstream(format!("invalid response body: {}", e))
        })
    }

    fn settled_events(&self, page: UsageEventList, now: DateTime<Utc>) -> Vec<RawEvent> {
        let cutoff = now - self.record_min_age;
        page.resources
            .into_iter()
            .take_while(|r| r.metadata.created_at <= cutoff)
            .map(|r| RawEvent::new(r.metadata.guid, self.kind, r.metadata.created_at, r.entity))
            .collect()
    }
}

#[async_trait]
impl EventFetcher for CfEventFetcher {
    fn kind(&self) -> EventKind {
        self.kind
    }

    #[instrument(skip(self, cancel, last_known), fields(kind = %self.kind))]
    async fn fetch_events(
        &self,
        cancel: &CancellationToken,
        last_known: Option<&RawEvent>,
    ) -> AppResult<Vec<RawEvent>> {
        let page = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            page = self.fetch_page(last_known) => page?,
        };

        let received = page.resources.len();
        let events = self.settled_events(page, Utc::now());
        debug!(
            "Fetched {} {} usage events after {:?}, {} old enough to keep",
            received,
            self.kind,
            last_known.map(|e| e.guid.as_str()),
            events.len()
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MIN_AGE: std::time::Duration = std::time::Duration::from_secs(300);
    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    fn resource(guid: &str, created_at: DateTime<Utc>) -> serde_json::Value {
        json!({
            "metadata": { "guid": guid, "created_at": created_at.to_rfc3339() },
            "entity": { "state": "STARTED", "app_guid": "a1" },
        })
    }

    fn fetcher(server: &MockServer, limit: u32) -> CfEventFetcher {
        CfEventFetcher::new(
            EventKind::App,
            server.uri(),
            Some("secret".to_string()),
            limit,
            MIN_AGE,
            TIMEOUT,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_page_has_no_cursor() {
        let server = MockServer::start().await;
        let old = Utc::now() - Duration::hours(1);
        Mock::given(method("GET"))
            .and(path("/v2/app_usage_events"))
            .and(query_param("results-per-page", "2"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [resource("g1", old), resource("g2", old)]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let events = fetcher(&server, 2)
            .fetch_events(&CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].guid, "g1");
        assert_eq!(events[0].kind, EventKind::App);
        assert_eq!(events[0].id, 0);
        assert_eq!(events[0].payload["app_guid"], "a1");

        let requests = server.received_requests().await.unwrap();
        assert!(!requests[0].url.query().unwrap_or_default().contains("after_guid"));
    }

    #[tokio::test]
    async fn test_cursor_is_last_known_guid() {
        let server = MockServer::start().await;
        let old = Utc::now() - Duration::hours(1);
        Mock::given(method("GET"))
            .and(path("/v2/app_usage_events"))
            .and(query_param("after_guid", "g2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [resource("g3", old)]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let last = RawEvent::new("g2", EventKind::App, old, json!({}));
        let events = fetcher(&server, 50)
            .fetch_events(&CancellationToken::new(), Some(&last))
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].guid, "g3");
    }

    #[tokio::test]
    async fn test_young_events_and_followers_are_held_back() {
        let server = MockServer::start().await;
        let old = Utc::now() - Duration::hours(1);
        let young = Utc::now() - Duration::minutes(1);
        Mock::given(method("GET"))
            .and(path("/v2/app_usage_events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [
                    resource("g1", old),
                    resource("g2", young),
                    resource("g3", old),
                ]
            })))
            .mount(&server)
            .await;

        let events = fetcher(&server, 50)
            .fetch_events(&CancellationToken::new(), None)
            .await
            .unwrap();

        let guids: Vec<&str> = events.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["g1"]);
    }

    #[tokio::test]
    async fn test_service_kind_uses_service_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/service_usage_events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resources": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher =
            CfEventFetcher::new(EventKind::Service, server.uri(), None, 10, MIN_AGE, TIMEOUT)
                .unwrap();
        assert_eq!(fetcher.kind(), EventKind::Service);
        let events = fetcher
            .fetch_events(&CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let result = fetcher(&server, 50)
            .fetch_events(&CancellationToken::new(), None)
            .await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_cancellation_returns_no_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "resources": [] }))
                    .set_delay(std::time::Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = fetcher(&server, 50).fetch_events(&cancel, None).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[test]
    fn test_fetch_limit_bounds() {
        for limit in [0, 101] {
            let result = CfEventFetcher::new(
                EventKind::App,
                "http://localhost",
                None,
                limit,
                MIN_AGE,
                TIMEOUT,
            );
            assert!(matches!(result, Err(AppError::Config(_))));
        }
        assert!(
            CfEventFetcher::new(EventKind::App, "http://localhost", None, 100, MIN_AGE, TIMEOUT)
                .is_ok()
        );
    }

    #[test]
    fn test_managed_metrics_are_not_served() {
        let result = CfEventFetcher::new(
            EventKind::ManagedMetric,
            "http://localhost",
            None,
            50,
            MIN_AGE,
            TIMEOUT,
        );
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
