//! PaaS Billing Database Layer
//!
//! This crate provides PostgreSQL database access and repository implementations
//! for the billing pipeline. It includes:
//!
//! - Connection pool management and migrations with sqlx
//! - The append-only raw event store
//! - Pricing configuration and consolidated-month storage
//! - In-memory repositories with the same behaviour, for tests

pub mod memory;
pub mod pool;
pub mod repositories;

pub use memory::{
    InMemoryConsolidationRepository, InMemoryPricingConfigRepository, InMemoryRawEventRepository,
};
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use billing_core::{AppError, AppResult};
pub use sqlx::PgPool;
