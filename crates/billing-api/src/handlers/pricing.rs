//! Pricing configuration readers

use crate::dto::QueryParams;
use actix_web::web::{Data, Json, Path};
use billing_core::{
    models::{CurrencyRate, PricingPlan, VatRate},
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppResult,
};
use billing_services::QueryService;

/// Plan versions effective during the range
pub async fn pricing_plans<E, P, C>(
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<Json<Vec<PricingPlan>>>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    let filter = params.filter()?;
    Ok(Json(service.pricing_plans(&filter)?))
}

/// Every version of one plan; 404 when the plan is unknown
pub async fn pricing_plan<E, P, C>(
    plan_guid: Path<String>,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<Json<Vec<PricingPlan>>>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    Ok(Json(service.pricing_plan(&plan_guid)?))
}

/// VAT rates effective during the range
pub async fn vat_rates<E, P, C>(
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<Json<Vec<VatRate>>>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    let filter = params.filter()?;
    Ok(Json(service.vat_rates(&filter)?))
}

/// Currency rates effective during the range
pub async fn currency_rates<E, P, C>(
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<Json<Vec<CurrencyRate>>>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    let filter = params.filter()?;
    Ok(Json(service.currency_rates(&filter)?))
}
