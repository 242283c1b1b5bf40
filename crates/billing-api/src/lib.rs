//! API layer for PaaS Billing
//!
//! HTTP handlers exposing usage, billable and forecast events, the pricing
//! configuration readers and per-plan cost totals.

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;

pub use dto::{HealthResponse, QueryParams};
pub use handlers::configure;
