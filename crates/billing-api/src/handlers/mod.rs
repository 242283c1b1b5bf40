//! HTTP request handlers
//!
//! Handlers are generic over the storage backends so the same routes run
//! against Postgres in production and in-memory stores in tests.

pub mod events;
pub mod pricing;
pub mod status;
pub mod stream;

use actix_web::web;
use billing_core::traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository};

/// Register every billing route
///
/// Expects `Data<QueryService<E, P, C>>` and `Data<Arc<JwtService>>` in app data.
pub fn configure<E, P, C>(cfg: &mut web::ServiceConfig)
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    cfg.route("/", web::get().to(status::health::<E, P, C>))
        .route("/usage_events", web::get().to(events::usage_events::<E, P, C>))
        .route("/billable_events", web::get().to(events::billable_events::<E, P, C>))
        .route("/forecast_events", web::get().to(events::forecast_events::<E, P, C>))
        .route("/pricing_plans", web::get().to(pricing::pricing_plans::<E, P, C>))
        .route(
            "/pricing_plans/{plan_guid}",
            web::get().to(pricing::pricing_plan::<E, P, C>),
        )
        .route("/vat_rates", web::get().to(pricing::vat_rates::<E, P, C>))
        .route("/currency_rates", web::get().to(pricing::currency_rates::<E, P, C>))
        .route("/totals", web::get().to(status::totals::<E, P, C>));
}
