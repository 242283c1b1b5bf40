//! Pricing configuration validation and the active configuration snapshot
//!
//! A `PricingConfig` is validated once and compiled into an immutable
//! `ActiveConfig`: formulas are parsed, versions are grouped by key and
//! every version carries its effective `[valid_from, valid_to)` range.

use billing_core::{
    models::{
        effective_ranges, is_month_boundary, CurrencyRate, PricingConfig, PricingPlan,
        PricingPlanComponent, TimeRange, UsageEvent, VatRate, Versioned, BILLING_CURRENCY,
        CURRENCY_CODES, VAT_CODES,
    },
    AppError, AppResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::constants::PLACEHOLDER_COMPONENT;
use crate::formula::Formula;

/// One version of a VAT or currency rate with its effective range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateVersion {
    pub code: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub rate: Decimal,
}

/// Plan component with its parsed formula
#[derive(Debug, Clone)]
pub struct CompiledComponent {
    pub name: String,
    pub formula: Formula,
    pub vat_code: String,
    pub currency_code: String,
    /// Synthesised zero-cost component that is priced without rate lookups
    pub placeholder: bool,
}

impl CompiledComponent {
    fn placeholder() -> AppResult<Self> {
        Ok(Self {
            name: PLACEHOLDER_COMPONENT.to_string(),
            formula: Formula::parse("0")?,
            vat_code: VAT_CODES[0].to_string(),
            currency_code: BILLING_CURRENCY.to_string(),
            placeholder: true,
        })
    }
}

/// One version of a pricing plan with its effective range
#[derive(Debug, Clone)]
pub struct PlanVersion {
    pub plan_guid: String,
    pub name: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub memory_in_mb: i64,
    pub storage_in_mb: i64,
    pub number_of_nodes: i64,
    pub components: Vec<CompiledComponent>,
}

impl PlanVersion {
    /// Effective range, open-ended versions stop at `DateTime::MAX_UTC`
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.valid_from,
            stop: self.valid_to.unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Latest version whose `valid_from` is at or before `ts`
pub fn rate_at(versions: &[RateVersion], ts: DateTime<Utc>) -> Option<&RateVersion> {
    versions.iter().rev().find(|v| v.valid_from <= ts)
}

fn overlaps(valid_from: DateTime<Utc>, valid_to: Option<DateTime<Utc>>, range: &TimeRange) -> bool {
    valid_from < range.stop && valid_to.map_or(true, |to| to > range.start)
}

/// Validate a configuration document
///
/// Checks month boundaries, uniqueness, vocabularies, rate coverage at
/// every plan version and that every formula parses.
pub fn validate_config(config: &PricingConfig) -> AppResult<()> {
    let mut seen = HashSet::new();
    for rate in &config.vat_rates {
        check_month_boundary("vat rate", &rate.code, rate.valid_from)?;
        if !VAT_CODES.contains(&rate.code.as_str()) {
            return Err(AppError::Validation(format!(
                "unknown vat code '{}'",
                rate.code
            )));
        }
        if rate.rate.is_sign_negative() {
            return Err(AppError::Validation(format!(
                "vat rate '{}' must not be negative",
                rate.code
            )));
        }
        if !seen.insert((rate.code.as_str(), rate.valid_from)) {
            return Err(AppError::Validation(format!(
                "duplicate vat rate '{}' valid from {}",
                rate.code,
                rate.valid_from.to_rfc3339()
            )));
        }
    }

    let mut seen = HashSet::new();
    for rate in &config.currency_rates {
        check_month_boundary("currency rate", &rate.code, rate.valid_from)?;
        if !CURRENCY_CODES.contains(&rate.code.as_str()) {
            return Err(AppError::Validation(format!(
                "unknown currency code '{}'",
                rate.code
            )));
        }
        if rate.rate.is_sign_negative() {
            return Err(AppError::Validation(format!(
                "currency rate '{}' must not be negative",
                rate.code
            )));
        }
        if rate.code == BILLING_CURRENCY && rate.rate != Decimal::ONE {
            return Err(AppError::Validation(format!(
                "currency rate for {} must be 1, got {}",
                BILLING_CURRENCY, rate.rate
            )));
        }
        if !seen.insert((rate.code.as_str(), rate.valid_from)) {
            return Err(AppError::Validation(format!(
                "duplicate currency rate '{}' valid from {}",
                rate.code,
                rate.valid_from.to_rfc3339()
            )));
        }
    }

    let vat_versions = group_rates(&config.vat_rates, |r: &VatRate| r.rate);
    let currency_versions = group_rates(&config.currency_rates, |r: &CurrencyRate| r.rate);

    let mut seen = HashSet::new();
    for plan in &config.pricing_plans {
        check_month_boundary("pricing plan", &plan.name, plan.valid_from)?;
        if !seen.insert((plan.plan_guid.as_str(), plan.valid_from)) {
            return Err(AppError::Validation(format!(
                "duplicate pricing plan '{}' ({}) valid from {}",
                plan.name,
                plan.plan_guid,
                plan.valid_from.to_rfc3339()
            )));
        }
        if plan.components.is_empty() {
            return Err(AppError::Validation(format!(
                "pricing plan '{}' ({}) has no components",
                plan.name, plan.plan_guid
            )));
        }

        let mut names = HashSet::new();
        for component in &plan.components {
            if component.name.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "pricing plan '{}' has a component without a name",
                    plan.name
                )));
            }
            if !names.insert(component.name.as_str()) {
                return Err(AppError::Validation(format!(
                    "pricing plan '{}' has duplicate component '{}'",
                    plan.name, component.name
                )));
            }
            compile_formula(plan, component)?;

            let vat = vat_versions.get(component.vat_code.as_str());
            if vat.and_then(|v| rate_at(v, plan.valid_from)).is_none() {
                return Err(AppError::Validation(format!(
                    "pricing plan '{}' component '{}': no vat rate '{}' effective at {}",
                    plan.name,
                    component.name,
                    component.vat_code,
                    plan.valid_from.to_rfc3339()
                )));
            }
            let currency = currency_versions.get(component.currency_code.as_str());
            if currency.and_then(|v| rate_at(v, plan.valid_from)).is_none() {
                return Err(AppError::Validation(format!(
                    "pricing plan '{}' component '{}': no currency rate '{}' effective at {}",
                    plan.name,
                    component.name,
                    component.currency_code,
                    plan.valid_from.to_rfc3339()
                )));
            }
        }
    }

    Ok(())
}

fn check_month_boundary(what: &str, key: &str, valid_from: DateTime<Utc>) -> AppResult<()> {
    if !is_month_boundary(valid_from) {
        return Err(AppError::Validation(format!(
            "{} '{}' valid_from {} must be the start of a month",
            what,
            key,
            valid_from.to_rfc3339()
        )));
    }
    Ok(())
}

fn compile_formula(plan: &PricingPlan, component: &PricingPlanComponent) -> AppResult<Formula> {
    Formula::parse(&component.formula).map_err(|e| match e {
        AppError::Formula(message) => AppError::Formula(format!(
            "pricing plan '{}' component '{}': {}",
            plan.name, component.name, message
        )),
        other => other,
    })
}

fn group_rates<T: Versioned>(
    items: &[T],
    rate: impl Fn(&T) -> Decimal,
) -> HashMap<String, Vec<RateVersion>> {
    let mut grouped: HashMap<String, Vec<RateVersion>> = HashMap::new();
    for (item, valid_to) in effective_ranges(items) {
        grouped
            .entry(item.version_key().to_string())
            .or_default()
            .push(RateVersion {
                code: item.version_key().to_string(),
                valid_from: item.valid_from(),
                valid_to,
                rate: rate(item),
            });
    }
    for versions in grouped.values_mut() {
        versions.sort_by_key(|v| v.valid_from);
    }
    grouped
}

/// Immutable, validated pricing configuration
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    version: i64,
    source: PricingConfig,
    plans: HashMap<String, Vec<PlanVersion>>,
    vat_rates: HashMap<String, Vec<RateVersion>>,
    currency_rates: HashMap<String, Vec<RateVersion>>,
}

impl ActiveConfig {
    /// Validate and compile a configuration
    pub fn new(version: i64, config: PricingConfig) -> AppResult<Self> {
        validate_config(&config)?;
        Self::compile(version, config)
    }

    fn compile(version: i64, config: PricingConfig) -> AppResult<Self> {
        let mut plans: HashMap<String, Vec<PlanVersion>> = HashMap::new();
        for (plan, valid_to) in effective_ranges(&config.pricing_plans) {
            let components = plan
                .components
                .iter()
                .map(|c| {
                    Ok(CompiledComponent {
                        name: c.name.clone(),
                        formula: compile_formula(plan, c)?,
                        vat_code: c.vat_code.clone(),
                        currency_code: c.currency_code.clone(),
                        placeholder: false,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;

            plans
                .entry(plan.plan_guid.clone())
                .or_default()
                .push(PlanVersion {
                    plan_guid: plan.plan_guid.clone(),
                    name: plan.name.clone(),
                    valid_from: plan.valid_from,
                    valid_to,
                    memory_in_mb: plan.memory_in_mb,
                    storage_in_mb: plan.storage_in_mb,
                    number_of_nodes: plan.number_of_nodes,
                    components,
                });
        }
        for versions in plans.values_mut() {
            versions.sort_by_key(|v| v.valid_from);
        }

        Ok(Self {
            version,
            vat_rates: group_rates(&config.vat_rates, |r: &VatRate| r.rate),
            currency_rates: group_rates(&config.currency_rates, |r: &CurrencyRate| r.rate),
            plans,
            source: config,
        })
    }

    /// Configuration with no plans or rates
    pub fn empty() -> Self {
        Self {
            version: 0,
            source: PricingConfig::default(),
            plans: HashMap::new(),
            vat_rates: HashMap::new(),
            currency_rates: HashMap::new(),
        }
    }

    /// Installed version number
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Configuration document this snapshot was compiled from
    pub fn source(&self) -> &PricingConfig {
        &self.source
    }

    pub fn ignore_missing_plans(&self) -> bool {
        self.source.ignore_missing_plans
    }

    /// Versions of a plan ordered by `valid_from`
    pub fn plan_versions(&self, plan_guid: &str) -> &[PlanVersion] {
        self.plans.get(plan_guid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Versions of a VAT rate ordered by `valid_from`
    pub fn vat_rate_versions(&self, code: &str) -> &[RateVersion] {
        self.vat_rates.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Versions of a currency rate ordered by `valid_from`
    pub fn currency_rate_versions(&self, code: &str) -> &[RateVersion] {
        self.currency_rates.get(code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Plans used by `usage` that are not covered from each interval's start
    ///
    /// Returns `(plan_guid, plan_name, earliest uncovered start)` per plan.
    pub fn missing_plans(&self, usage: &[UsageEvent]) -> Vec<(String, String, DateTime<Utc>)> {
        let mut missing: BTreeMap<&str, (&str, DateTime<Utc>)> = BTreeMap::new();
        for event in usage {
            let covered = self
                .plan_versions(&event.plan_guid)
                .first()
                .map_or(false, |first| first.valid_from <= event.event_start);
            if covered {
                continue;
            }
            missing
                .entry(event.plan_guid.as_str())
                .and_modify(|(_, start)| *start = (*start).min(event.event_start))
                .or_insert((event.plan_name.as_str(), event.event_start));
        }
        missing
            .into_iter()
            .map(|(guid, (name, start))| (guid.to_string(), name.to_string(), start))
            .collect()
    }

    /// Ensure every plan used by `usage` is priced
    ///
    /// Fails with the first missing plan unless `ignore_missing_plans` is
    /// set, in which case a copy of this configuration gets a zero-cost
    /// placeholder version from epoch up to the plan's first real version.
    /// Placeholders never consult VAT or currency rates.
    pub fn with_coverage(self: &Arc<Self>, usage: &[UsageEvent]) -> AppResult<Arc<Self>> {
        let missing = self.missing_plans(usage);
        if missing.is_empty() {
            return Ok(Arc::clone(self));
        }

        if !self.ignore_missing_plans() {
            let (guid, name, start) = &missing[0];
            return Err(AppError::Config(format!(
                "missing '{}' pricing plan configuration for '{}' ({})",
                name,
                guid,
                start.to_rfc3339()
            )));
        }

        let mut covered = (**self).clone();
        for (guid, name, _) in &missing {
            warn!(plan_guid = %guid, plan_name = %name, "Synthesising placeholder pricing plan");
            let versions = covered.plans.entry(guid.clone()).or_default();
            let valid_to = versions.first().map(|first| first.valid_from);
            versions.insert(
                0,
                PlanVersion {
                    plan_guid: guid.clone(),
                    name: name.clone(),
                    valid_from: DateTime::<Utc>::UNIX_EPOCH,
                    valid_to,
                    memory_in_mb: 0,
                    storage_in_mb: 0,
                    number_of_nodes: 0,
                    components: vec![CompiledComponent::placeholder()?],
                },
            );
        }
        info!("Added {} placeholder pricing plans", missing.len());
        Ok(Arc::new(covered))
    }

    /// Plan versions whose effective range overlaps `range`
    pub fn pricing_plans(&self, range: &TimeRange) -> Vec<PricingPlan> {
        let mut plans: Vec<PricingPlan> = effective_ranges(&self.source.pricing_plans)
            .into_iter()
            .filter(|(plan, valid_to)| overlaps(plan.valid_from, *valid_to, range))
            .map(|(plan, _)| plan.clone())
            .collect();
        plans.sort_by(|a, b| (a.valid_from, &a.plan_guid).cmp(&(b.valid_from, &b.plan_guid)));
        plans
    }

    /// VAT rates whose effective range overlaps `range`
    pub fn vat_rates(&self, range: &TimeRange) -> Vec<VatRate> {
        let mut rates: Vec<VatRate> = effective_ranges(&self.source.vat_rates)
            .into_iter()
            .filter(|(rate, valid_to)| overlaps(rate.valid_from, *valid_to, range))
            .map(|(rate, _)| rate.clone())
            .collect();
        rates.sort_by(|a, b| (a.valid_from, &a.code).cmp(&(b.valid_from, &b.code)));
        rates
    }

    /// Currency rates whose effective range overlaps `range`
    pub fn currency_rates(&self, range: &TimeRange) -> Vec<CurrencyRate> {
        let mut rates: Vec<CurrencyRate> = effective_ranges(&self.source.currency_rates)
            .into_iter()
            .filter(|(rate, valid_to)| overlaps(rate.valid_from, *valid_to, range))
            .map(|(rate, _)| rate.clone())
            .collect();
        rates.sort_by(|a, b| (a.valid_from, &a.code).cmp(&(b.valid_from, &b.code)));
        rates
    }
}
