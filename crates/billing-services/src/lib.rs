//! Business logic services for PaaS billing
//!
//! This crate turns raw lifecycle events into priced, consolidated bills:
//!
//! - `formula` - the safe arithmetic language used by plan components
//! - `schema` - pricing configuration validation and the active config snapshot
//! - `normalizer` - raw events to half-open usage intervals
//! - `pricing` - usage intervals to billable events
//! - `engine` - derived-view cache, config refresh and on-demand pricing
//! - `consolidator` - freezing closed months
//! - `query` - streaming usage, billable and forecast queries
//!
//! # Architecture
//!
//! Services are generic over the repository traits from `billing-core`,
//! hold their dependencies in `Arc`s and are shared across async tasks.
//! All entry points are instrumented with tracing.

pub mod consolidator;
pub mod engine;
pub mod formula;
pub mod normalizer;
pub mod pricing;
pub mod query;
pub mod schema;
pub mod view_cache;

pub use consolidator::Consolidator;
pub use engine::BillingEngine;
pub use formula::{Bindings, EvalError, Formula};
pub use normalizer::normalize;
pub use pricing::price_usage_event;
pub use query::{BillableStream, QueryService, UsageStream};
pub use schema::{validate_config, ActiveConfig};

/// Business logic constants
pub mod constants {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Plan used for every running app instance
    pub const COMPUTE_PLAN_GUID: &str = "f4d4b95a-f55e-4593-8d54-3364c25798c4";

    /// Service reported for app usage
    pub const COMPUTE_SERVICE_GUID: &str = "4f6f0a18-cdd4-4e51-8b6b-dc39b696e61b";

    /// Plan used for one-off tasks
    pub const TASK_PLAN_GUID: &str = "ebfa9453-ef66-450c-8c37-d53dfd931038";

    /// Plan used while an app is staging
    pub const STAGING_PLAN_GUID: &str = "9d071c77-7a68-4346-9981-e8dafac95b6f";

    /// Organisation every forecast must be made against
    pub const DUMMY_ORG_GUID: &str = "00000001-0000-0000-0000-000000000000";

    /// Space filled into forecast events that omit one
    pub const DUMMY_SPACE_GUID: &str = "00000001-0001-0000-0000-000000000000";

    /// Smallest non-zero charge per priced partition, in source currency
    pub const MINIMUM_CHARGE: Decimal = dec!(0.01);

    /// Component name of synthesised placeholder plans
    pub const PLACEHOLDER_COMPONENT: &str = "pending";

    /// Days after a month ends before it is consolidated automatically
    pub const CONSOLIDATION_DELAY_DAYS: i64 = 5;

    /// Megabytes per gigabyte in managed-service scaling audits
    pub const MB_PER_GB: i64 = 1024;
}
