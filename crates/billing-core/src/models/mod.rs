//! Domain models for PaaS billing
//!
//! Raw events flow in from the platform, pricing configuration describes how
//! usage is charged, and usage/billable events are the derived views served
//! to clients.

pub mod billable;
pub mod consolidation;
pub mod filter;
pub mod pricing;
pub mod raw_event;
pub mod usage;

pub use billable::{sort_billable_events, BillableEvent, Price, PriceComponent, TotalCost};
pub use consolidation::ConsolidatedMonth;
pub use filter::{
    is_month_boundary, month_key, month_start, next_month, parse_timestamp, truncate_month,
    EventFilter, TimeRange,
};
pub use pricing::{
    effective_ranges, CurrencyRate, PricingConfig, PricingPlan, PricingPlanComponent, VatRate,
    Versioned, BILLING_CURRENCY, CURRENCY_CODES, VAT_CODES,
};
pub use raw_event::{EventKind, RawEvent, RawEventFilter};
pub use usage::{sort_usage_events, UsageEvent, OPEN_END};
