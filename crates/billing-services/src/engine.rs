//! Billing engine
//!
//! Owns the active pricing configuration and the derived-view caches.
//! Usage is normalized from every raw event up to a watermark; priced
//! ranges are computed on demand and cached per watermark and config
//! version.

use billing_core::{
    models::{sort_billable_events, BillableEvent, PricingConfig, TimeRange, UsageEvent},
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppError, AppResult,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument};

use crate::normalizer::normalize;
use crate::pricing::price_usage_events;
use crate::schema::ActiveConfig;
use crate::view_cache::{PricedKey, ViewCache, ViewKey};

/// Price usage intervals intersecting `range` under `config`
///
/// Plan coverage is checked first, so strict configurations fail before any
/// pricing happens. Rows are returned in canonical order.
pub fn price_range(
    config: &Arc<ActiveConfig>,
    usage: &[UsageEvent],
    range: &TimeRange,
) -> AppResult<Vec<BillableEvent>> {
    let in_range: Vec<UsageEvent> = usage
        .iter()
        .filter(|e| e.range().intersect(range).is_some())
        .cloned()
        .collect();
    let config = config.with_coverage(&in_range)?;

    let mut billable = price_usage_events(&in_range, range, &config)?;
    sort_billable_events(&mut billable);
    Ok(billable)
}

/// Normalization, pricing and configuration lifecycle
pub struct BillingEngine<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    events: Arc<E>,
    configs: Arc<P>,
    consolidation: Arc<C>,
    active: RwLock<Arc<ActiveConfig>>,
    pricing_lock: Mutex<()>,
    usage_cache: ViewCache<ViewKey, Vec<UsageEvent>>,
    priced_cache: ViewCache<PricedKey, Vec<BillableEvent>>,
}

impl<E, P, C> BillingEngine<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    /// Create an engine with an empty configuration
    pub fn new(events: Arc<E>, configs: Arc<P>, consolidation: Arc<C>, cache_capacity: usize) -> Self {
        Self {
            events,
            configs,
            consolidation,
            active: RwLock::new(Arc::new(ActiveConfig::empty())),
            pricing_lock: Mutex::new(()),
            usage_cache: ViewCache::new(cache_capacity),
            priced_cache: ViewCache::new(cache_capacity),
        }
    }

    /// Raw event store
    pub fn events(&self) -> &Arc<E> {
        &self.events
    }

    /// Consolidated month store
    pub fn consolidation(&self) -> &Arc<C> {
        &self.consolidation
    }

    /// Snapshot of the active configuration
    pub fn active_config(&self) -> Arc<ActiveConfig> {
        Arc::clone(&*self.active.read())
    }

    /// Exclusive access to configuration changes and month freezing
    pub async fn lock_pricing(&self) -> MutexGuard<'_, ()> {
        self.pricing_lock.lock().await
    }

    /// Activate the installed configuration, if any
    #[instrument(skip(self))]
    pub async fn load_config(&self) -> AppResult<bool> {
        let Some((version, config)) = self.configs.load().await? else {
            info!("No pricing configuration installed");
            return Ok(false);
        };

        let active = ActiveConfig::new(version, config)?;
        self.activate(active);
        info!("Activated pricing configuration version {}", version);
        Ok(true)
    }

    fn activate(&self, config: ActiveConfig) {
        *self.active.write() = Arc::new(config);
        self.usage_cache.clear();
        self.priced_cache.clear();
    }

    /// Highest stored raw-event id
    pub async fn max_event_id(&self) -> AppResult<i64> {
        self.events.max_event_id().await
    }

    /// Usage normalized from every raw event with `id <= max_event_id`
    #[instrument(skip(self))]
    pub async fn usage_at(&self, max_event_id: i64) -> AppResult<Arc<Vec<UsageEvent>>> {
        let key = ViewKey::usage(max_event_id);
        if let Some(usage) = self.usage_cache.get(&key) {
            debug!("Usage view cache HIT at watermark {}", max_event_id);
            return Ok(usage);
        }

        debug!("Usage view cache MISS at watermark {}", max_event_id);
        let events = self.events.all_events(max_event_id).await?;
        let usage = normalize(&events);
        Ok(self.usage_cache.insert(key, usage))
    }

    /// Usage normalized from every stored raw event
    pub async fn usage(&self) -> AppResult<Arc<Vec<UsageEvent>>> {
        let max_event_id = self.max_event_id().await?;
        self.usage_at(max_event_id).await
    }

    /// Billable events for `range` from raw events up to `max_event_id`
    #[instrument(skip(self))]
    pub async fn billable_at(
        &self,
        range: TimeRange,
        max_event_id: i64,
    ) -> AppResult<Arc<Vec<BillableEvent>>> {
        let config = self.active_config();
        let key = ViewKey::new(max_event_id, config.version()).priced(range);
        if let Some(billable) = self.priced_cache.get(&key) {
            return Ok(billable);
        }

        let usage = self.usage_at(max_event_id).await?;
        let billable = price_range(&config, &usage, &range)?;
        debug!(
            "Priced {} billable events for [{}, {})",
            billable.len(),
            range.start,
            range.stop
        );
        Ok(self.priced_cache.insert(key, billable))
    }

    /// Billable events for `range` from every stored raw event
    pub async fn billable(&self, range: TimeRange) -> AppResult<Arc<Vec<BillableEvent>>> {
        let max_event_id = self.max_event_id().await?;
        self.billable_at(range, max_event_id).await
    }

    /// Validate, check and install a new pricing configuration
    ///
    /// Unless `ignore_missing_plans` is set, every stored usage interval
    /// must be covered by a plan. Every consolidated month is then re-priced
    /// from the raw events visible when it was frozen. If any check fails
    /// nothing is installed.
    #[instrument(skip(self, config))]
    pub async fn refresh_config(&self, config: PricingConfig) -> AppResult<i64> {
        let candidate = Arc::new(ActiveConfig::new(0, config.clone())?);
        let _guard = self.lock_pricing().await;

        if !candidate.ignore_missing_plans() {
            let usage = self.usage().await?;
            candidate.with_coverage(&usage).map_err(|e| {
                error!("Refusing configuration: {}", e);
                e
            })?;
        }

        for month in self.consolidation.consolidated_months().await? {
            let usage = self.usage_at(month.raw_event_watermark).await?;
            let repriced = price_range(&candidate, &usage, &TimeRange::month(month.month))?;
            let frozen = self.consolidation.get_month(month.month, &[]).await?;

            if repriced != frozen {
                error!(
                    "Refusing configuration: consolidated month {} would change",
                    month.month
                );
                return Err(AppError::ConsolidatedMonthChanged(format!(
                    "{} ({} frozen rows, {} re-priced rows)",
                    month.month,
                    frozen.len(),
                    repriced.len()
                )));
            }
        }

        let version = self.configs.install(&config).await?;
        self.activate(ActiveConfig::new(version, config)?);
        info!("Installed pricing configuration version {}", version);
        Ok(version)
    }
}
