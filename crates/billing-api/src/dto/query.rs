//! Query-string parameters shared by the event endpoints
//!
//! `org_guid` may be repeated, so the query string is read as a list of
//! pairs rather than into a flat struct.

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use billing_core::{
    models::{EventFilter, UsageEvent},
    AppError, AppResult,
};
use futures::future::{ready, Ready};
use tracing::warn;

/// Raw query parameters of an event request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub range_start: Option<String>,
    pub range_stop: Option<String>,
    pub org_guids: Vec<String>,
    pub events: Option<String>,
}

impl QueryParams {
    /// Parse a raw query string
    pub fn from_query(query: &str) -> AppResult<Self> {
        let pairs = web::Query::<Vec<(String, String)>>::from_query(query)
            .map_err(|e| AppError::InvalidInput(format!("invalid query string: {}", e)))?;
        Ok(Self::from_pairs(pairs.into_inner()))
    }

    /// Collect known parameters, ignoring the rest
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "range_start" => params.range_start = Some(value),
                "range_stop" => params.range_stop = Some(value),
                "org_guid" => params.org_guids.push(value),
                "events" => params.events = Some(value),
                _ => {}
            }
        }
        params
    }

    /// Validated time range and organisation filter
    pub fn filter(&self) -> AppResult<EventFilter> {
        EventFilter::parse(
            self.range_start.as_deref(),
            self.range_stop.as_deref(),
            self.org_guids.clone(),
        )
    }

    /// Usage events supplied for a forecast
    pub fn forecast_events(&self) -> AppResult<Vec<UsageEvent>> {
        let raw = self
            .events
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AppError::MissingField("events".to_string()))?;

        serde_json::from_str(raw).map_err(|e| {
            warn!("Invalid forecast events: {}", e);
            AppError::InvalidInput(format!("events: {}", e))
        })
    }
}

impl FromRequest for QueryParams {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::from_query(req.query_string()).map_err(Into::into))
    }
}
