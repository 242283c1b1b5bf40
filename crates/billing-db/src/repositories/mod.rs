//! Repository implementations
//!
//! This module contains concrete implementations of the repository traits
//! defined in billing-core, using sqlx for PostgreSQL access.

pub mod config_repo;
pub mod consolidation_repo;
pub mod raw_event_repo;

pub use config_repo::PgPricingConfigRepository;
pub use consolidation_repo::PgConsolidationRepository;
pub use raw_event_repo::PgRawEventRepository;
