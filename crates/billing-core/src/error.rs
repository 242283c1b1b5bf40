//! Error type shared by every billing crate
//!
//! Variants are grouped by the stage that raises them. Each maps to an HTTP
//! status; 5xx responses carry a fixed body so storage or upstream details
//! never reach clients.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Body returned for every 5xx response
pub const INTERNAL_SERVER_ERROR_BODY: &str = "internal server error";

/// Failure anywhere in collection, pricing, consolidation or serving
#[derive(Error, Debug)]
pub enum AppError {
    // Storage
    #[error("database query failed: {0}")]
    Database(String),

    #[error("database connection unavailable: {0}")]
    Pool(String),

    #[error("database transaction aborted: {0}")]
    Transaction(String),

    // Access
    #[error("token has expired")]
    TokenExpired,

    #[error("token rejected: {0}")]
    InvalidToken(String),

    #[error("not authorised: {0}")]
    Unauthorized(String),

    #[error("forecasts may only be requested for the forecast organisation")]
    Forbidden,

    // Collection
    #[error("invalid raw event: {0}")]
    InvalidEvent(String),

    #[error("{kind} event {guid} is already stored")]
    DuplicateEvent { kind: String, guid: String },

    #[error("usage-event API request failed: {0}")]
    Upstream(String),

    #[error("cancelled before completion")]
    Cancelled,

    // Pricing
    #[error("bad formula: {0}")]
    Formula(String),

    #[error("plan '{plan}' component '{component}' could not be evaluated: {message}")]
    Evaluation {
        plan: String,
        component: String,
        message: String,
    },

    // Consolidation
    #[error("month {0} has not ended")]
    MonthNotClosed(String),

    #[error("change would alter consolidated month {0}")]
    ConsolidatedMonthChanged(String),

    // Request input
    #[error("{0}")]
    Validation(String),

    #[error("invalid parameter: {0}")]
    InvalidInput(String),

    #[error("missing parameter '{0}'")]
    MissingField(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    // Process
    #[error("internal failure: {0}")]
    Internal(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("could not encode or decode JSON: {0}")]
    Serialization(String),
}

impl AppError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        use AppError::*;
        match self {
            Validation(_) | InvalidInput(_) | MissingField(_) | InvalidEvent(_) | Formula(_) => {
                StatusCode::BAD_REQUEST
            }
            TokenExpired | InvalidToken(_) | Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            NotFound(_) => StatusCode::NOT_FOUND,
            DuplicateEvent { .. } | MonthNotClosed(_) | Conflict(_) => StatusCode::CONFLICT,
            Database(_) | Pool(_) | Transaction(_) | Upstream(_) | Cancelled | Evaluation { .. }
            | ConsolidatedMonthChanged(_) | Internal(_) | Config(_) | Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable code used in 4xx bodies and logs
    pub fn error_code(&self) -> &'static str {
        use AppError::*;
        match self {
            Database(_) => "database_error",
            Pool(_) => "pool_error",
            Transaction(_) => "transaction_error",
            TokenExpired => "token_expired",
            InvalidToken(_) => "invalid_token",
            Unauthorized(_) => "unauthorized",
            Forbidden => "forbidden",
            InvalidEvent(_) => "invalid_event",
            DuplicateEvent { .. } => "duplicate_event",
            Upstream(_) => "upstream_error",
            Cancelled => "cancelled",
            Formula(_) => "formula_error",
            Evaluation { .. } => "evaluation_error",
            MonthNotClosed(_) => "month_not_closed",
            ConsolidatedMonthChanged(_) => "consolidated_month_changed",
            Validation(_) => "validation_error",
            InvalidInput(_) => "invalid_input",
            MissingField(_) => "missing_field",
            NotFound(_) => "not_found",
            Conflict(_) => "conflict",
            Internal(_) => "internal_error",
            Config(_) => "config_error",
            Serialization(_) => "serialization_error",
        }
    }

    /// Whether the failure is worth retrying on the next collection tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Pool(_)
                | AppError::Transaction(_)
                | AppError::Upstream(_)
                | AppError::Cancelled
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
            return HttpResponse::build(status).json(json!({ "error": INTERNAL_SERVER_ERROR_BODY }));
        }

        HttpResponse::build(status).json(json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        }))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    fn body(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.error_response();
        let status = resp.status();
        let bytes = resp.into_body().try_into_bytes().unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_statuses_by_stage() {
        let cases = [
            (AppError::Validation("bad range".into()), StatusCode::BAD_REQUEST),
            (AppError::Formula("illegal token".into()), StatusCode::BAD_REQUEST),
            (AppError::TokenExpired, StatusCode::UNAUTHORIZED),
            (AppError::Forbidden, StatusCode::FORBIDDEN),
            (AppError::NotFound("pricing plan 'p1'".into()), StatusCode::NOT_FOUND),
            (
                AppError::DuplicateEvent {
                    kind: "app".into(),
                    guid: "abc".into(),
                },
                StatusCode::CONFLICT,
            ),
            (AppError::MonthNotClosed("2024-05".into()), StatusCode::CONFLICT),
            (AppError::Upstream("503".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                AppError::ConsolidatedMonthChanged("2024-01".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{}", err);
        }
    }

    #[test]
    fn test_duplicate_message_names_event() {
        let err = AppError::DuplicateEvent {
            kind: "service".into(),
            guid: "g-1".into(),
        };
        assert_eq!(err.to_string(), "service event g-1 is already stored");
        assert_eq!(err.error_code(), "duplicate_event");
    }

    #[test]
    fn test_transient_errors() {
        assert!(AppError::Upstream("503".into()).is_transient());
        assert!(AppError::Pool("timeout".into()).is_transient());
        assert!(!AppError::Validation("x".into()).is_transient());
        assert!(!AppError::ConsolidatedMonthChanged("2024-01".into()).is_transient());
    }

    #[test]
    fn test_server_errors_do_not_leak_details() {
        let (status, value) =
            body(AppError::Database("password authentication failed for user billing".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value, json!({ "error": "internal server error" }));
    }

    #[test]
    fn test_client_errors_carry_message() {
        let (status, value) = body(AppError::Validation(
            "range_start must be before range_stop".into(),
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "validation_error");
        assert_eq!(value["message"], "range_start must be before range_stop");
        assert_eq!(value["status"], 400);
    }
}
