//! Query facade
//!
//! Every query returns a boxed stream of rows. Billable queries are split at
//! month boundaries: whole consolidated months are served from the frozen
//! table, everything else is priced on demand. Months are produced lazily,
//! so a failure surfaces as an error item after the rows already sent.

use billing_core::{
    models::{
        month_key, next_month, sort_usage_events, truncate_month, BillableEvent, CurrencyRate,
        EventFilter, PricingPlan, TimeRange, TotalCost, UsageEvent, VatRate,
    },
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppError, AppResult,
};
use chrono::{NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::constants::{DUMMY_ORG_GUID, DUMMY_SPACE_GUID};
use crate::engine::{price_range, BillingEngine};

/// Stream of usage rows
pub type UsageStream = BoxStream<'static, AppResult<UsageEvent>>;

/// Stream of billable rows
pub type BillableStream = BoxStream<'static, AppResult<BillableEvent>>;

fn rows_or_error<T: Send + 'static>(result: AppResult<Vec<T>>) -> BoxStream<'static, AppResult<T>> {
    match result {
        Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(async move { Err(e) }).boxed(),
    }
}

fn only_orgs(rows: &[BillableEvent], filter: &EventFilter) -> Vec<BillableEvent> {
    rows.iter()
        .filter(|row| filter.matches_org(&row.org_guid))
        .cloned()
        .collect()
}

/// Read-side entry point for usage, billable and forecast queries
pub struct QueryService<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    engine: Arc<BillingEngine<E, P, C>>,
}

impl<E, P, C> Clone for QueryService<E, P, C>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E, P, C> QueryService<E, P, C>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    pub fn new(engine: Arc<BillingEngine<E, P, C>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<BillingEngine<E, P, C>> {
        &self.engine
    }

    /// Check the raw event store is reachable
    pub async fn ping(&self) -> AppResult<()> {
        self.engine.events().ping().await
    }

    /// Usage intervals intersecting the range, clipped and org-filtered
    #[instrument(skip(self))]
    pub async fn usage_events(&self, filter: &EventFilter) -> AppResult<UsageStream> {
        filter.validate()?;
        let range = filter.range();
        let usage = self.engine.usage().await?;

        let mut rows: Vec<UsageEvent> = usage
            .iter()
            .filter(|e| filter.matches_org(&e.org_guid))
            .filter_map(|e| e.clip(&range))
            .collect();
        sort_usage_events(&mut rows);

        debug!("Serving {} usage events", rows.len());
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Billable events for the range, month by month
    #[instrument(skip(self))]
    pub async fn billable_events(&self, filter: &EventFilter) -> AppResult<BillableStream> {
        filter.validate()?;
        let watermarks: Arc<HashMap<NaiveDate, i64>> = Arc::new(
            self.engine
                .consolidation()
                .consolidated_months()
                .await?
                .into_iter()
                .map(|m| (m.month, m.raw_event_watermark))
                .collect(),
        );

        let engine = Arc::clone(&self.engine);
        let rows = stream::iter(filter.split_by_month())
            .then(move |month_filter| {
                let engine = Arc::clone(&engine);
                let watermarks = Arc::clone(&watermarks);
                async move { billable_month(&engine, &watermarks, &month_filter).await }
            })
            .flat_map(rows_or_error);
        Ok(rows.boxed())
    }

    /// Price caller-supplied usage without touching stored events
    ///
    /// Every event and requested organisation must belong to the forecast
    /// organisation. Missing organisation or space guids are filled in.
    #[instrument(skip(self, usage), fields(events = usage.len()))]
    pub async fn forecast_billable_events(
        &self,
        usage: Vec<UsageEvent>,
        filter: &EventFilter,
    ) -> AppResult<BillableStream> {
        filter.validate()?;
        if filter.org_guids.iter().any(|org| org != DUMMY_ORG_GUID) {
            return Err(AppError::Forbidden);
        }

        let range = filter.range();
        let mut prepared = Vec::with_capacity(usage.len());
        for (position, mut event) in usage.into_iter().enumerate() {
            if event.org_guid.is_empty() {
                event.org_guid = DUMMY_ORG_GUID.to_string();
            }
            if event.org_guid != DUMMY_ORG_GUID {
                return Err(AppError::Forbidden);
            }
            if event.space_guid.is_empty() {
                event.space_guid = DUMMY_SPACE_GUID.to_string();
            }
            if event.plan_guid.is_empty() {
                return Err(AppError::MissingField("plan_guid".to_string()));
            }
            if event.event_start >= event.event_stop {
                return Err(AppError::Validation(format!(
                    "forecast event '{}' must start before it stops",
                    event.event_guid
                )));
            }
            event.sequence = position as i64 + 1;
            if event.range().intersect(&range).is_some() {
                prepared.push(event);
            }
        }

        let config = self
            .engine
            .active_config()
            .with_coverage(&prepared)
            .map_err(|e| match e {
                AppError::Config(message) => AppError::Validation(message),
                other => other,
            })?;

        let mut rows = Vec::new();
        for month in range.split_by_month() {
            rows.extend(price_range(&config, &prepared, &month)?);
        }
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Ex-VAT cost per plan over every month with usage up to the current one
    #[instrument(skip(self))]
    pub async fn total_costs(&self) -> AppResult<Vec<TotalCost>> {
        let usage = self.engine.usage().await?;
        let Some(first) = usage.iter().map(|e| e.event_start).min() else {
            return Ok(Vec::new());
        };

        let start = truncate_month(first);
        let stop = next_month(Utc::now());
        if start >= stop {
            return Ok(Vec::new());
        }

        let filter = EventFilter::new(TimeRange::new(start, stop)?, Vec::new());
        let totals = self
            .billable_events(&filter)
            .await?
            .try_fold(BTreeMap::new(), |mut totals, row| async move {
                *totals.entry(row.plan_guid).or_insert(Decimal::ZERO) += row.price.ex_vat;
                Ok(totals)
            })
            .await?;

        Ok(totals
            .into_iter()
            .map(|(plan_guid, cost)| TotalCost {
                plan_guid,
                cost: cost.normalize(),
            })
            .collect())
    }

    /// Plan versions effective during the range
    pub fn pricing_plans(&self, filter: &EventFilter) -> AppResult<Vec<PricingPlan>> {
        filter.validate()?;
        Ok(self.engine.active_config().pricing_plans(&filter.range()))
    }

    /// Every version of one pricing plan, oldest first
    pub fn pricing_plan(&self, plan_guid: &str) -> AppResult<Vec<PricingPlan>> {
        let config = self.engine.active_config();
        let mut versions: Vec<PricingPlan> = config
            .source()
            .pricing_plans
            .iter()
            .filter(|plan| plan.plan_guid == plan_guid)
            .cloned()
            .collect();
        if versions.is_empty() {
            return Err(AppError::NotFound(format!("pricing plan '{}'", plan_guid)));
        }
        versions.sort_by_key(|plan| plan.valid_from);
        Ok(versions)
    }

    /// VAT rates effective during the range
    pub fn vat_rates(&self, filter: &EventFilter) -> AppResult<Vec<VatRate>> {
        filter.validate()?;
        Ok(self.engine.active_config().vat_rates(&filter.range()))
    }

    /// Currency rates effective during the range
    pub fn currency_rates(&self, filter: &EventFilter) -> AppResult<Vec<CurrencyRate>> {
        filter.validate()?;
        Ok(self.engine.active_config().currency_rates(&filter.range()))
    }
}

/// Rows of one month-sized piece of a billable query
///
/// Whole consolidated months are read verbatim. Partial pieces of a
/// consolidated month are priced from the raw events visible when the
/// month was frozen.
async fn billable_month<E, P, C>(
    engine: &BillingEngine<E, P, C>,
    watermarks: &HashMap<NaiveDate, i64>,
    filter: &EventFilter,
) -> AppResult<Vec<BillableEvent>>
where
    E: RawEventRepository,
    P: PricingConfigRepository,
    C: ConsolidationRepository,
{
    let range = filter.range();
    let month = month_key(range.start);

    match watermarks.get(&month) {
        Some(_) if range.is_whole_months() => {
            debug!("Serving consolidated month {}", month);
            engine
                .consolidation()
                .get_month(month, &filter.org_guids)
                .await
        }
        Some(watermark) => {
            let rows = engine.billable_at(range, *watermark).await?;
            Ok(only_orgs(&rows, filter))
        }
        None => {
            let rows = engine.billable(range).await?;
            Ok(only_orgs(&rows, filter))
        }
    }
}
