//! Usage intervals to billable events
//!
//! A usage interval is clipped to the query range and split into
//! partitions wherever the plan version, the component's currency rate or
//! its VAT rate changes. Each partition is priced independently.

use billing_core::{
    models::{BillableEvent, Price, PriceComponent, TimeRange, UsageEvent},
    AppError, AppResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::constants::MINIMUM_CHARGE;
use crate::formula::Bindings;
use crate::schema::{rate_at, ActiveConfig, CompiledComponent, PlanVersion, RateVersion};

fn evaluation_error(plan: &PlanVersion, component: &CompiledComponent, message: impl ToString) -> AppError {
    AppError::Evaluation {
        plan: plan.name.clone(),
        component: component.name.clone(),
        message: message.to_string(),
    }
}

/// Value from the usage event, falling back to the plan default when unset
fn or_plan_default(value: i64, default: i64) -> Decimal {
    Decimal::from(if value == 0 { default } else { value })
}

/// Rate boundaries strictly inside `piece`
fn boundaries<'a>(
    versions: &'a [RateVersion],
    piece: &TimeRange,
) -> impl Iterator<Item = DateTime<Utc>> + 'a {
    let piece = *piece;
    versions
        .iter()
        .map(|v| v.valid_from)
        .filter(move |ts| *ts > piece.start && *ts < piece.stop)
}

/// Split `piece` at every currency or VAT change of `component`
fn partitions(config: &ActiveConfig, component: &CompiledComponent, piece: &TimeRange) -> Vec<TimeRange> {
    if component.placeholder {
        return vec![*piece];
    }
    let mut cuts: Vec<DateTime<Utc>> = boundaries(config.vat_rate_versions(&component.vat_code), piece)
        .chain(boundaries(config.currency_rate_versions(&component.currency_code), piece))
        .collect();
    cuts.sort();
    cuts.dedup();

    let mut pieces = Vec::with_capacity(cuts.len() + 1);
    let mut start = piece.start;
    for cut in cuts {
        pieces.push(TimeRange { start, stop: cut });
        start = cut;
    }
    pieces.push(TimeRange {
        start,
        stop: piece.stop,
    });
    pieces
}

fn price_partition(
    config: &ActiveConfig,
    plan: &PlanVersion,
    component: &CompiledComponent,
    bindings: &Bindings,
    partition: &TimeRange,
) -> AppResult<PriceComponent> {
    let millis = (partition.stop - partition.start).num_milliseconds();
    let bindings = Bindings {
        time_in_seconds: Decimal::new(millis, 3),
        ..*bindings
    };

    if component.placeholder {
        return Ok(PriceComponent {
            name: component.name.clone(),
            plan_name: plan.name.clone(),
            start: partition.start,
            stop: partition.stop,
            vat_rate: Decimal::ZERO,
            vat_code: component.vat_code.clone(),
            currency_code: component.currency_code.clone(),
            currency_rate: Decimal::ONE,
            inc_vat: Decimal::ZERO,
            ex_vat: Decimal::ZERO,
        });
    }

    let mut amount = component
        .formula
        .eval(&bindings)
        .map_err(|e| evaluation_error(plan, component, e))?;
    // Free components stay free; only positive amounts are raised to the minimum
    if amount > Decimal::ZERO && amount < MINIMUM_CHARGE {
        amount = MINIMUM_CHARGE;
    }

    let currency = rate_at(config.currency_rate_versions(&component.currency_code), partition.start)
        .ok_or_else(|| {
            AppError::Config(format!(
                "no currency rate '{}' effective at {}",
                component.currency_code,
                partition.start.to_rfc3339()
            ))
        })?;
    let vat = rate_at(config.vat_rate_versions(&component.vat_code), partition.start).ok_or_else(|| {
        AppError::Config(format!(
            "no vat rate '{}' effective at {}",
            component.vat_code,
            partition.start.to_rfc3339()
        ))
    })?;

    let ex_vat = amount
        .checked_mul(currency.rate)
        .ok_or_else(|| evaluation_error(plan, component, "overflow converting currency"))?;
    let inc_vat = Decimal::ONE
        .checked_add(vat.rate)
        .and_then(|factor| ex_vat.checked_mul(factor))
        .ok_or_else(|| evaluation_error(plan, component, "overflow applying vat"))?;

    Ok(PriceComponent {
        name: component.name.clone(),
        plan_name: plan.name.clone(),
        start: partition.start,
        stop: partition.stop,
        vat_rate: vat.rate,
        vat_code: component.vat_code.clone(),
        currency_code: component.currency_code.clone(),
        currency_rate: currency.rate,
        inc_vat: inc_vat.normalize(),
        ex_vat: ex_vat.normalize(),
    })
}

/// Price one usage interval within `range`
///
/// Returns `None` when the interval does not intersect the range. Fails
/// when the plan does not cover the interval or a formula cannot be
/// evaluated.
pub fn price_usage_event(
    event: &UsageEvent,
    range: &TimeRange,
    config: &ActiveConfig,
) -> AppResult<Option<BillableEvent>> {
    let Some(clipped) = event.clip(range) else {
        return Ok(None);
    };

    let versions = config.plan_versions(&event.plan_guid);
    let covered = versions
        .first()
        .map_or(false, |first| first.valid_from <= clipped.event_start);
    if !covered {
        return Err(AppError::Config(format!(
            "missing '{}' pricing plan configuration for '{}' ({})",
            event.plan_name,
            event.plan_guid,
            clipped.event_start.to_rfc3339()
        )));
    }

    let mut details: Vec<(DateTime<Utc>, usize, PriceComponent)> = Vec::new();
    for plan in versions {
        let Some(piece) = plan.range().intersect(&clipped.range()) else {
            continue;
        };
        let bindings = Bindings {
            time_in_seconds: Decimal::ZERO,
            memory_in_mb: or_plan_default(clipped.memory_in_mb, plan.memory_in_mb),
            storage_in_mb: or_plan_default(clipped.storage_in_mb, plan.storage_in_mb),
            number_of_nodes: or_plan_default(clipped.number_of_nodes, plan.number_of_nodes),
        };

        for (position, component) in plan.components.iter().enumerate() {
            for partition in partitions(config, component, &piece) {
                let detail = price_partition(config, plan, component, &bindings, &partition)?;
                details.push((partition.start, position, detail));
            }
        }
    }
    details.sort_by_key(|(start, position, _)| (*start, *position));

    let price = Price::from_details(details.into_iter().map(|(_, _, d)| d).collect());
    Ok(Some(BillableEvent::from_usage(clipped, price)))
}

/// Price every interval within `range`, skipping those outside it
pub fn price_usage_events(
    events: &[UsageEvent],
    range: &TimeRange,
    config: &ActiveConfig,
) -> AppResult<Vec<BillableEvent>> {
    let mut billable = Vec::new();
    for event in events {
        if let Some(priced) = price_usage_event(event, range, config)? {
            billable.push(priced);
        }
    }
    Ok(billable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use billing_core::models::{
        parse_timestamp, CurrencyRate, PricingConfig, PricingPlan, PricingPlanComponent, VatRate,
        OPEN_END,
    };
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn component(name: &str, formula: &str, currency: &str) -> PricingPlanComponent {
        PricingPlanComponent {
            name: name.to_string(),
            formula: formula.to_string(),
            vat_code: "Standard".to_string(),
            currency_code: currency.to_string(),
        }
    }

    fn plan(valid_from: &str, name: &str, components: Vec<PricingPlanComponent>) -> PricingPlan {
        PricingPlan {
            plan_guid: "p1".to_string(),
            valid_from: ts(valid_from),
            name: name.to_string(),
            memory_in_mb: 0,
            storage_in_mb: 0,
            number_of_nodes: 0,
            components,
        }
    }

    fn config(plans: Vec<PricingPlan>) -> ActiveConfig {
        ActiveConfig::new(
            1,
            PricingConfig {
                vat_rates: vec![
                    VatRate {
                        code: "Standard".to_string(),
                        valid_from: ts("epoch"),
                        rate: dec!(0.2),
                    },
                    VatRate {
                        code: "Standard".to_string(),
                        valid_from: ts("2001-03-01"),
                        rate: dec!(0.25),
                    },
                ],
                currency_rates: vec![
                    CurrencyRate {
                        code: "GBP".to_string(),
                        valid_from: ts("epoch"),
                        rate: dec!(1),
                    },
                    CurrencyRate {
                        code: "USD".to_string(),
                        valid_from: ts("epoch"),
                        rate: dec!(0.5),
                    },
                ],
                pricing_plans: plans,
                ignore_missing_plans: false,
            },
        )
        .unwrap()
    }

    fn usage(start: &str, stop: DateTime<Utc>) -> UsageEvent {
        UsageEvent {
            event_guid: "e1".to_string(),
            event_start: ts(start),
            event_stop: stop,
            resource_guid: "r1".to_string(),
            resource_name: "APP1".to_string(),
            resource_type: "app".to_string(),
            org_guid: "o1".to_string(),
            space_guid: "s1".to_string(),
            plan_guid: "p1".to_string(),
            plan_name: "app".to_string(),
            service_guid: None,
            service_name: None,
            number_of_nodes: 1,
            memory_in_mb: 512,
            storage_in_mb: 0,
            space_name: None,
            sequence: 1,
        }
    }

    fn year() -> TimeRange {
        TimeRange::new(ts("2001-01-01"), ts("2002-01-01")).unwrap()
    }

    #[test]
    fn test_hourly_price_with_minimum_charge() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("compute", "ceil($time_in_seconds/3600) * 0.01", "GBP")],
        )]);
        let event = usage("2001-01-01", ts("2001-01-01") + Duration::hours(1));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        assert_eq!(billable.price.ex_vat.to_string(), "0.01");
        assert_eq!(billable.price.inc_vat.to_string(), "0.012");
        assert_eq!(billable.price.details[0].plan_name, "PLAN1");
        assert_eq!(billable.price.details[0].currency_rate, dec!(1));
    }

    #[test]
    fn test_tiny_amount_rounded_up_to_minimum() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("compute", "$time_in_seconds * 0.000001", "GBP")],
        )]);
        let event = usage("2001-01-01", ts("2001-01-01") + Duration::seconds(10));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        assert_eq!(billable.price.ex_vat, dec!(0.01));
    }

    #[test]
    fn test_zero_amount_is_not_floored() {
        let config = config(vec![plan(
            "2001-01-01",
            "MIXED",
            vec![
                component("free", "0", "GBP"),
                component("metered", "$time_in_seconds * 0.000001", "GBP"),
            ],
        )]);
        let event = usage("2001-01-01", ts("2001-01-01") + Duration::seconds(10));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        let amounts: Vec<Decimal> = billable.price.details.iter().map(|d| d.ex_vat).collect();
        assert_eq!(amounts, vec![Decimal::ZERO, dec!(0.01)]);
        assert_eq!(billable.price.ex_vat, dec!(0.01));
    }

    #[test]
    fn test_currency_conversion() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("compute", "$time_in_seconds", "USD")],
        )]);
        let event = usage("2001-01-01", ts("2001-01-03"));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        assert_eq!(billable.price.ex_vat, dec!(86400));
        assert_eq!(billable.price.inc_vat, dec!(103680));
    }

    #[test]
    fn test_partitions_at_plan_and_vat_boundaries() {
        let config = config(vec![
            plan("2001-01-01", "v1", vec![component("compute", "$time_in_seconds", "GBP")]),
            plan("2001-02-01", "v2", vec![component("compute", "$time_in_seconds * 2", "GBP")]),
        ]);
        let event = usage("2001-01-31", ts("2001-03-02"));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        let details = &billable.price.details;
        assert_eq!(details.len(), 3);
        assert_eq!(details[0].plan_name, "v1");
        assert_eq!(details[1].plan_name, "v2");
        assert_eq!(details[1].vat_rate, dec!(0.2));
        assert_eq!(details[2].start, ts("2001-03-01"));
        assert_eq!(details[2].vat_rate, dec!(0.25));

        let ex: Decimal = details.iter().map(|d| d.ex_vat).sum();
        let inc: Decimal = details.iter().map(|d| d.inc_vat).sum();
        assert_eq!(billable.price.ex_vat, ex.normalize());
        assert_eq!(billable.price.inc_vat, inc.normalize());
    }

    #[test]
    fn test_details_ordered_by_time_then_component() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![
                component("compute", "$time_in_seconds", "GBP"),
                component("memory", "$memory_in_mb", "GBP"),
            ],
        )]);
        let event = usage("2001-02-27", ts("2001-03-02"));

        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        let names: Vec<_> = billable.price.details.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["compute", "memory", "compute", "memory"]);
    }

    #[test]
    fn test_open_interval_clipped_to_range() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("compute", "$time_in_seconds * 4", "GBP")],
        )]);
        let event = usage("2001-01-01", OPEN_END);
        let range = TimeRange::new(ts("2001-01-01"), ts("2001-01-01") + Duration::minutes(10)).unwrap();

        let billable = price_usage_event(&event, &range, &config).unwrap().unwrap();
        assert_eq!(billable.event_stop, range.stop);
        assert_eq!(billable.price.ex_vat, dec!(2400));
    }

    #[test]
    fn test_outside_range_and_uncovered() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("compute", "1", "GBP")],
        )]);
        let before = usage("2000-06-01", ts("2000-06-02"));
        assert!(price_usage_event(&before, &year(), &config).unwrap().is_none());

        let range = TimeRange::new(ts("2000-01-01"), ts("2001-01-01")).unwrap();
        let err = price_usage_event(&before, &range, &config).unwrap_err();
        assert!(err.to_string().contains("missing 'app' pricing plan configuration for 'p1'"));
    }

    #[test]
    fn test_plan_defaults_fill_unset_usage() {
        let mut with_defaults = plan(
            "2001-01-01",
            "DB",
            vec![component("storage", "$storage_in_mb * $number_of_nodes", "GBP")],
        );
        with_defaults.storage_in_mb = 100;
        with_defaults.number_of_nodes = 3;
        let config = config(vec![with_defaults]);

        let mut event = usage("2001-01-01", ts("2001-01-02"));
        event.number_of_nodes = 0;
        let billable = price_usage_event(&event, &year(), &config).unwrap().unwrap();
        assert_eq!(billable.price.ex_vat, dec!(300));
    }

    #[test]
    fn test_division_by_zero_names_plan_and_component() {
        let config = config(vec![plan(
            "2001-01-01",
            "PLAN1",
            vec![component("broken", "$time_in_seconds / $storage_in_mb", "GBP")],
        )]);
        let event = usage("2001-01-01", ts("2001-01-02"));

        match price_usage_event(&event, &year(), &config) {
            Err(AppError::Evaluation { plan, component, .. }) => {
                assert_eq!(plan, "PLAN1");
                assert_eq!(component, "broken");
            }
            other => panic!("expected evaluation error, got {:?}", other),
        }
    }
}
