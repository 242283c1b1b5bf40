//! End-to-end billing scenarios over the in-memory repositories

use billing_core::{
    models::{
        parse_timestamp, BillableEvent, CurrencyRate, EventFilter, EventKind, PricingConfig,
        PricingPlan, PricingPlanComponent, RawEvent, TimeRange, UsageEvent, VatRate,
    },
    traits::RawEventRepository,
    AppError,
};
use billing_db::{
    InMemoryConsolidationRepository, InMemoryPricingConfigRepository, InMemoryRawEventRepository,
};
use billing_services::{
    constants::{COMPUTE_PLAN_GUID, DUMMY_ORG_GUID},
    normalize, price_usage_event, BillingEngine, Consolidator, QueryService,
};
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

type Engine = BillingEngine<
    InMemoryRawEventRepository,
    InMemoryPricingConfigRepository,
    InMemoryConsolidationRepository,
>;

const SERVICE_PLAN_GUID: &str = "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe5";
const APP_GUID: &str = "c85e98f0-6d1b-4f45-9368-ea58263165a0";
const SERVICE_INSTANCE_GUID: &str = "efadb775-58c4-4e17-8087-6d0f4febc489";
const ORG_GUID: &str = "51ba75ef-edc0-47ad-a633-a8f6e8770944";

fn ts(s: &str) -> DateTime<Utc> {
    parse_timestamp(s).unwrap()
}

fn t0() -> DateTime<Utc> {
    ts("2001-01-01T00:00:00Z")
}

fn component(formula: &str, currency: &str) -> PricingPlanComponent {
    PricingPlanComponent {
        name: "compute".to_string(),
        formula: formula.to_string(),
        vat_code: "Standard".to_string(),
        currency_code: currency.to_string(),
    }
}

fn plan(guid: &str, valid_from: &str, name: &str, formula: &str, currency: &str) -> PricingPlan {
    PricingPlan {
        plan_guid: guid.to_string(),
        valid_from: ts(valid_from),
        name: name.to_string(),
        memory_in_mb: 0,
        storage_in_mb: 0,
        number_of_nodes: 0,
        components: vec![component(formula, currency)],
    }
}

fn pricing(plans: Vec<PricingPlan>) -> PricingConfig {
    PricingConfig {
        vat_rates: vec![VatRate {
            code: "Standard".to_string(),
            valid_from: ts("epoch"),
            rate: dec!(0.2),
        }],
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
    }
}

fn default_pricing() -> PricingConfig {
    pricing(vec![
        plan(COMPUTE_PLAN_GUID, "epoch", "app", "$time_in_seconds * 4", "GBP"),
        plan(SERVICE_PLAN_GUID, "epoch", "postgres small", "$time_in_seconds * 2", "GBP"),
    ])
}

fn app(guid: &str, at: DateTime<Utc>, state: &str, instances: i64, memory: i64) -> RawEvent {
    RawEvent::new(
        guid,
        EventKind::App,
        at,
        json!({
            "state": state,
            "app_guid": APP_GUID,
            "app_name": "APP1",
            "org_guid": ORG_GUID,
            "space_guid": "276f4886-ac40-492d-a8cd-b2646637ba76",
            "space_name": "ORG1-SPACE1",
            "instance_count": instances,
            "memory_in_mb_per_instance": memory,
        }),
    )
}

fn service(guid: &str, at: DateTime<Utc>, state: &str) -> RawEvent {
    RawEvent::new(
        guid,
        EventKind::Service,
        at,
        json!({
            "state": state,
            "service_instance_guid": SERVICE_INSTANCE_GUID,
            "service_instance_name": "DB1",
            "service_instance_type": "managed_service_instance",
            "service_plan_guid": SERVICE_PLAN_GUID,
            "service_plan_name": "small",
            "service_guid": "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe6",
            "service_label": "postgres",
            "org_guid": ORG_GUID,
            "space_guid": "276f4886-ac40-492d-a8cd-b2646637ba76",
        }),
    )
}

async fn setup(events: Vec<RawEvent>, config: PricingConfig) -> QueryService<
    InMemoryRawEventRepository,
    InMemoryPricingConfigRepository,
    InMemoryConsolidationRepository,
> {
    let store = Arc::new(InMemoryRawEventRepository::new());
    if !events.is_empty() {
        store.store_events(&events).await.unwrap();
    }
    let engine: Engine = BillingEngine::new(
        store,
        Arc::new(InMemoryPricingConfigRepository::new()),
        Arc::new(InMemoryConsolidationRepository::new()),
        16,
    );
    engine.refresh_config(config).await.unwrap();
    QueryService::new(Arc::new(engine))
}

fn filter(start: DateTime<Utc>, stop: DateTime<Utc>) -> EventFilter {
    EventFilter::new(TimeRange::new(start, stop).unwrap(), vec![])
}

async fn billable(query: &QueryService<
    InMemoryRawEventRepository,
    InMemoryPricingConfigRepository,
    InMemoryConsolidationRepository,
>, filter: &EventFilter) -> Vec<BillableEvent> {
    query
        .billable_events(filter)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

fn assert_totals_match_details(rows: &[BillableEvent]) {
    for row in rows {
        let ex: Decimal = row.price.details.iter().map(|d| d.ex_vat).sum();
        let inc: Decimal = row.price.details.iter().map(|d| d.inc_vat).sum();
        assert_eq!(row.price.ex_vat, ex);
        assert_eq!(row.price.inc_vat, inc);
    }
}

#[tokio::test]
async fn s1_single_compute_lifecycle() {
    let query = setup(
        vec![
            app("e1", t0(), "STARTED", 1, 512),
            app("e2", t0() + Duration::minutes(30), "STOPPED", 1, 512),
        ],
        default_pricing(),
    )
    .await;

    let rows = billable(&query, &filter(t0(), t0() + Duration::days(1))).await;
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].event_stop - rows[0].event_start).num_seconds(), 1800);
    assert_eq!(rows[0].price.ex_vat, dec!(7200));
    assert_eq!(rows[0].price.inc_vat, dec!(8640));
    assert_eq!(rows[0].space_name.as_deref(), Some("ORG1-SPACE1"));
    assert_totals_match_details(&rows);
}

#[tokio::test]
async fn s2_scale_fans_out_instances() {
    let query = setup(
        vec![
            app("e1", t0(), "STARTED", 1, 512),
            app("e2", t0() + Duration::minutes(30), "STARTED", 2, 1024),
            app("e3", t0() + Duration::minutes(60), "STOPPED", 2, 1024),
        ],
        default_pricing(),
    )
    .await;

    let rows = billable(&query, &filter(t0(), t0() + Duration::days(1))).await;
    assert_eq!(rows.len(), 3);

    let scaled: Vec<_> = rows
        .iter()
        .filter(|r| r.event_start == t0() + Duration::minutes(30))
        .collect();
    assert_eq!(scaled.len(), 2);
    assert!(scaled.iter().all(|r| r.memory_in_mb == 1024 && r.number_of_nodes == 1));
    assert!(scaled
        .iter()
        .all(|r| r.event_stop == t0() + Duration::minutes(60)));
    assert_totals_match_details(&rows);
}

#[tokio::test]
async fn s3_plan_boundary_splits_details() {
    let start = ts("2001-01-31T00:00:00Z");
    let config = pricing(vec![
        plan(COMPUTE_PLAN_GUID, "epoch", "v1", "$time_in_seconds * 4", "GBP"),
        plan(COMPUTE_PLAN_GUID, "2001-02-01", "v2", "$time_in_seconds * 8", "GBP"),
    ]);
    let query = setup(
        vec![
            app("e1", start, "STARTED", 1, 512),
            app("e2", start + Duration::days(2), "STOPPED", 1, 512),
        ],
        config,
    )
    .await;

    // Priced directly over a range spanning both versions: one event, two partitions
    let engine = query.engine();
    let usage = engine.usage().await.unwrap();
    let range = TimeRange::new(ts("2001-01-01"), ts("2001-03-01")).unwrap();
    let priced = price_usage_event(&usage[0], &range, &engine.active_config())
        .unwrap()
        .unwrap();
    assert_eq!(priced.price.details.len(), 2);
    assert_eq!(priced.price.details[0].plan_name, "v1");
    assert_eq!(priced.price.details[1].plan_name, "v2");
    assert_eq!(priced.price.ex_vat, dec!(1036800));

    // Through the query facade the months are served separately
    let rows = billable(&query, &EventFilter::new(range, vec![])).await;
    assert_eq!(rows.len(), 2);
    let total: Decimal = rows.iter().map(|r| r.price.ex_vat).sum();
    assert_eq!(total, dec!(1036800));
}

#[tokio::test]
async fn s4_currency_conversion() {
    let config = pricing(vec![plan(COMPUTE_PLAN_GUID, "epoch", "app", "$time_in_seconds", "USD")]);
    let query = setup(
        vec![
            app("e1", t0(), "STARTED", 1, 512),
            app("e2", t0() + Duration::days(2), "STOPPED", 1, 512),
        ],
        config,
    )
    .await;

    let rows = billable(&query, &filter(t0(), t0() + Duration::days(7))).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].price.ex_vat, dec!(86400));
    assert_eq!(rows[0].price.inc_vat, dec!(103680));
    assert_eq!(rows[0].price.details[0].currency_rate, dec!(0.5));
}

#[tokio::test]
async fn s5_service_update_produces_two_events() {
    let query = setup(
        vec![
            service("e1", t0(), "CREATED"),
            service("e2", t0() + Duration::minutes(10), "UPDATED"),
            service("e3", t0() + Duration::minutes(20), "DELETED"),
        ],
        default_pricing(),
    )
    .await;

    let rows = billable(&query, &filter(t0(), t0() + Duration::days(1))).await;
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!((row.event_stop - row.event_start).num_seconds(), 600);
        assert_eq!(row.price.ex_vat, dec!(1200));
        assert_eq!(row.resource_type, "postgres");
    }
}

#[tokio::test]
async fn s6_open_app_clipped_to_range() {
    let query = setup(vec![app("e1", t0(), "STARTED", 1, 512)], default_pricing()).await;
    let range = filter(t0(), t0() + Duration::minutes(10));

    let rows = billable(&query, &range).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_stop, t0() + Duration::minutes(10));
    assert_eq!(rows[0].price.ex_vat, dec!(2400));

    let usage: Vec<UsageEvent> = query
        .usage_events(&range)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].event_stop, t0() + Duration::minutes(10));
}

#[tokio::test]
async fn org_filter_restricts_rows() {
    let query = setup(
        vec![
            app("e1", t0(), "STARTED", 1, 512),
            service("e2", t0(), "CREATED"),
        ],
        default_pricing(),
    )
    .await;

    let mine = EventFilter::new(
        TimeRange::new(t0(), t0() + Duration::hours(1)).unwrap(),
        vec![ORG_GUID.to_string()],
    );
    assert_eq!(billable(&query, &mine).await.len(), 2);

    let other = EventFilter::new(
        TimeRange::new(t0(), t0() + Duration::hours(1)).unwrap(),
        vec!["someone-else".to_string()],
    );
    assert!(billable(&query, &other).await.is_empty());
}

#[tokio::test]
async fn forecast_matches_billable_totals() {
    let mut started = app("e1", t0(), "STARTED", 2, 512);
    started.payload["org_guid"] = json!(DUMMY_ORG_GUID);
    let mut stopped = app("e2", t0() + Duration::days(40), "STOPPED", 2, 512);
    stopped.payload["org_guid"] = json!(DUMMY_ORG_GUID);
    let query = setup(vec![started, stopped], default_pricing()).await;

    let range = EventFilter::new(
        TimeRange::new(t0(), ts("2001-03-01")).unwrap(),
        vec![DUMMY_ORG_GUID.to_string()],
    );
    let usage: Vec<UsageEvent> = query
        .usage_events(&range)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let forecast: Vec<BillableEvent> = query
        .forecast_billable_events(usage, &range)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let actual = billable(&query, &range).await;

    let sum = |rows: &[BillableEvent]| rows.iter().map(|r| r.price.inc_vat).sum::<Decimal>();
    assert_eq!(forecast.len(), actual.len());
    assert_eq!(sum(&forecast), sum(&actual));
}

#[tokio::test]
async fn forecast_rejects_foreign_orgs_and_unknown_plans() {
    let query = setup(vec![], default_pricing()).await;
    let range = filter(t0(), t0() + Duration::days(1));

    let foreign = EventFilter::new(range.range(), vec![ORG_GUID.to_string()]);
    assert!(matches!(
        query.forecast_billable_events(vec![], &foreign).await,
        Err(AppError::Forbidden)
    ));

    let unknown = UsageEvent {
        event_guid: "f1".to_string(),
        event_start: t0(),
        event_stop: t0() + Duration::hours(1),
        resource_guid: "r1".to_string(),
        resource_name: "forecast".to_string(),
        resource_type: "app".to_string(),
        org_guid: String::new(),
        space_guid: String::new(),
        plan_guid: "no-such-plan".to_string(),
        plan_name: "mystery".to_string(),
        service_guid: None,
        service_name: None,
        number_of_nodes: 1,
        memory_in_mb: 64,
        storage_in_mb: 0,
        space_name: None,
        sequence: 0,
    };
    assert!(matches!(
        query.forecast_billable_events(vec![unknown], &range).await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn consolidated_months_served_verbatim() {
    let query = setup(
        vec![app("e1", ts("2001-01-31T00:00:00Z"), "STARTED", 1, 512)],
        default_pricing(),
    )
    .await;
    let engine = Arc::clone(query.engine());
    let consolidator = Consolidator::new(Arc::clone(&engine), ts("2001-01-01").date_naive());
    consolidator
        .consolidate_month(ts("2001-01-01").date_naive())
        .await
        .unwrap();

    let january = filter(ts("2001-01-01"), ts("2001-02-01"));
    let before = billable(&query, &january).await;

    // A late stop inside the frozen month is stored but does not change it
    engine
        .events()
        .store_events(&[app("e2", ts("2001-01-31T12:00:00Z"), "STOPPED", 1, 512)])
        .await
        .unwrap();
    let after = billable(&query, &january).await;
    assert_eq!(before, after);
    assert_eq!(after[0].price.ex_vat, dec!(345600));

    // The following month reflects the late stop
    let february = filter(ts("2001-02-01"), ts("2001-03-01"));
    assert!(billable(&query, &february).await.is_empty());
}

#[tokio::test]
async fn total_costs_per_plan() {
    let query = setup(
        vec![
            app("e1", t0(), "STARTED", 1, 512),
            app("e2", t0() + Duration::minutes(30), "STOPPED", 1, 512),
            service("e3", t0(), "CREATED"),
            service("e4", t0() + Duration::minutes(10), "DELETED"),
        ],
        default_pricing(),
    )
    .await;

    let totals = query.total_costs().await.unwrap();
    assert_eq!(totals.len(), 2);
    let compute = totals.iter().find(|t| t.plan_guid == COMPUTE_PLAN_GUID).unwrap();
    assert_eq!(compute.cost, dec!(7200));
    let service = totals.iter().find(|t| t.plan_guid == SERVICE_PLAN_GUID).unwrap();
    assert_eq!(service.cost, dec!(1200));
}

fn lifecycle() -> impl Strategy<Value = Vec<(i64, bool, i64)>> {
    // (minutes since previous event, started?, instance count)
    prop::collection::vec((1i64..180, any::<bool>(), 1i64..4), 1..12)
}

proptest! {
    #[test]
    fn first_instance_intervals_cover_live_time(steps in lifecycle(), window in 0i64..600) {
        let mut events = Vec::new();
        let mut at = t0();
        for (id, (gap, started, instances)) in steps.iter().enumerate() {
            at += Duration::minutes(*gap);
            let state = if *started { "STARTED" } else { "STOPPED" };
            let mut event = app(&format!("e{}", id), at, state, *instances, 64);
            event.id = id as i64 + 1;
            events.push(event);
        }

        let start = t0() + Duration::minutes(window);
        let range = TimeRange::new(start, start.max(at) + Duration::hours(1)).unwrap();
        let raw_guids: Vec<&str> = events.iter().map(|e| e.guid.as_str()).collect();
        let mut first_instances: Vec<_> = normalize(&events)
            .into_iter()
            .filter(|e| raw_guids.contains(&e.event_guid.as_str()))
            .filter_map(|e| e.clip(&range))
            .collect();
        first_instances.sort_by_key(|e| e.event_start);

        for pair in first_instances.windows(2) {
            prop_assert!(pair[0].event_stop <= pair[1].event_start);
        }

        let mut live = 0i64;
        let mut running_since: Option<DateTime<Utc>> = None;
        for event in &events {
            let started = event.payload["state"] == "STARTED";
            if let Some(since) = running_since.take() {
                if let Some(piece) = (TimeRange { start: since, stop: event.created_at }).intersect(&range) {
                    live += (piece.stop - piece.start).num_seconds();
                }
            }
            if started {
                running_since = Some(event.created_at);
            }
        }
        if let Some(since) = running_since {
            if let Some(piece) = (TimeRange { start: since, stop: range.stop }).intersect(&range) {
                live += (piece.stop - piece.start).num_seconds();
            }
        }

        let covered: i64 = first_instances.iter().map(|e| e.duration_seconds()).sum();
        prop_assert_eq!(covered, live);
    }
}
