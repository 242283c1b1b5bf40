//! Raw event collection for PaaS Billing
//!
//! This crate pulls lifecycle events from the platform's usage-event APIs
//! and appends them to the raw event store.
//!
//! # Architecture
//!
//! ```text
//! Cloud Controller /v2/*_usage_events
//!         |
//!         v
//!  CfEventFetcher (one per kind, EventFetcher)
//!         |
//!         v
//!  Collector (Syncing / Collecting / Scheduled)
//!         |
//!         v
//!  RawEventRepository
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use billing_collector::{CfEventFetcher, Collector};
//! use billing_core::models::EventKind;
//!
//! let fetcher = CfEventFetcher::from_config(EventKind::App, &config.upstream, &config.collector)?;
//! let collector = Collector::new(store, Arc::new(fetcher), config.collector.clone())?;
//! tokio::spawn(async move { collector.run(cancel).await });
//! ```

pub mod cf_fetcher;
pub mod collector;

pub use cf_fetcher::CfEventFetcher;
pub use collector::{Collector, CollectorState};

/// Event kinds served by the Cloud Foundry usage-event APIs
pub const CF_EVENT_KINDS: [billing_core::models::EventKind; 2] = [
    billing_core::models::EventKind::App,
    billing_core::models::EventKind::Service,
];
