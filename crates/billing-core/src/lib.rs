//! PaaS Billing Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the billing pipeline. It includes:
//!
//! - Domain models (RawEvent, PricingConfig, UsageEvent, BillableEvent, filters)
//! - Storage and fetcher traits
//! - Unified error handling with HTTP response mapping
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
