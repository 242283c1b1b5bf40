//! Service configuration
//!
//! Layered as built-in defaults, then `config/default` and `config/{RUN_MODE}`
//! files, then `BILLING__SECTION__KEY` environment variables. The pricing
//! document itself is a separate JSON file named by `billing.pricing_config_path`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use validator::Validate;

use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub collector: CollectorConfig,
    pub upstream: UpstreamConfig,
    pub billing: BillingConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8881
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_timeout() -> u64 {
    30
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Apply pending migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Authentication configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// JWT signing secret shared with the token issuer
    pub jwt_secret: String,

    /// JWT token expiration in minutes
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_minutes: i64,
}

fn default_jwt_expiration() -> i64 {
    60
}

/// Event collector configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct CollectorConfig {
    /// Run the collectors in this process
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Wait between polls when nothing new was found
    #[serde(default = "default_schedule")]
    #[validate(range(min = 1))]
    pub schedule_secs: u64,

    /// Wait between polls while catching up
    #[serde(default = "default_min_wait_time")]
    #[validate(range(min = 3))]
    pub min_wait_time_secs: u64,

    /// Wait before the first poll
    #[serde(default = "default_initial_wait")]
    pub initial_wait_secs: u64,

    /// Page size requested from the upstream
    #[serde(default = "default_fetch_limit")]
    #[validate(range(min = 1, max = 100))]
    pub fetch_limit: u32,

    /// Events younger than this are left for a later poll
    #[serde(default = "default_record_min_age")]
    #[validate(range(min = 300))]
    pub record_min_age_secs: u64,
}

fn default_schedule() -> u64 {
    900 // 15 minutes
}

fn default_min_wait_time() -> u64 {
    3
}

fn default_initial_wait() -> u64 {
    1
}

fn default_fetch_limit() -> u32 {
    50
}

fn default_record_min_age() -> u64 {
    300 // 5 minutes
}

impl CollectorConfig {
    /// Check the scheduling constraints
    pub fn check(&self) -> Result<(), AppError> {
        self.validate()
            .map_err(|e| AppError::Config(format!("invalid collector configuration: {}", e)))
    }

    pub fn schedule(&self) -> Duration {
        Duration::from_secs(self.schedule_secs)
    }

    pub fn min_wait_time(&self) -> Duration {
        Duration::from_secs(self.min_wait_time_secs)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_secs(self.initial_wait_secs)
    }

    pub fn record_min_age(&self) -> Duration {
        Duration::from_secs(self.record_min_age_secs)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_secs: default_schedule(),
            min_wait_time_secs: default_min_wait_time(),
            initial_wait_secs: default_initial_wait(),
            fetch_limit: default_fetch_limit(),
            record_min_age_secs: default_record_min_age(),
        }
    }
}

/// Upstream platform API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the platform API
    pub api_url: String,

    /// Bearer token for the usage-event endpoints
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// Billing-specific configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BillingConfig {
    /// Path of the JSON pricing document
    #[serde(default = "default_pricing_config_path")]
    pub pricing_config_path: String,

    /// First month eligible for automatic consolidation
    #[serde(default = "default_consolidation_start_date")]
    pub consolidation_start_date: String,

    /// Run the background consolidator
    #[serde(default = "default_true")]
    pub consolidate_enabled: bool,

    /// Seconds between consolidation passes
    #[serde(default = "default_consolidation_interval")]
    pub consolidation_interval_secs: u64,

    /// Maximum number of priced ranges kept in the derived-view cache
    #[serde(default = "default_view_cache_capacity")]
    pub view_cache_capacity: usize,
}

fn default_pricing_config_path() -> String {
    "config/pricing.json".to_string()
}

fn default_consolidation_start_date() -> String {
    "2017-07-01".to_string()
}

fn default_consolidation_interval() -> u64 {
    3600
}

fn default_view_cache_capacity() -> usize {
    64
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pricing_config_path: default_pricing_config_path(),
            consolidation_start_date: default_consolidation_start_date(),
            consolidate_enabled: true,
            consolidation_interval_secs: default_consolidation_interval(),
            view_cache_capacity: default_view_cache_capacity(),
        }
    }
}

impl AppConfig {
    /// Load the layered configuration
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8881)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("server.timeout_secs", 30)?
            .set_default("database.max_connections", 10)?
            .set_default("database.run_migrations", true)?
            .set_default("auth.jwt_expiration_minutes", 60)?
            .set_default("collector.enabled", true)?
            .set_default("collector.schedule_secs", 900)?
            .set_default("collector.min_wait_time_secs", 3)?
            .set_default("collector.initial_wait_secs", 1)?
            .set_default("collector.fetch_limit", 50)?
            .set_default("collector.record_min_age_secs", 300)?
            .set_default("upstream.request_timeout_secs", 30)?
            .set_default("billing.pricing_config_path", "config/pricing.json")?
            .set_default("billing.consolidation_start_date", "2017-07-01")?
            .set_default("billing.consolidate_enabled", true)?
            .set_default("billing.consolidation_interval_secs", 3600)?
            .set_default("billing.view_cache_capacity", 64)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with BILLING_ prefix
            .add_source(
                Environment::with_prefix("BILLING")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Address the HTTP server binds to
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
