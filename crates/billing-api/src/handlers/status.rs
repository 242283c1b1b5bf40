//! Liveness and cost summary handlers

use crate::dto::HealthResponse;
use actix_web::{
    web::{Data, Json},
    HttpResponse,
};
use billing_auth::AdminUser;
use billing_core::{
    models::TotalCost,
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppResult,
};
use billing_services::QueryService;
use tracing::{error, info, instrument};

/// `{"ok": true}` while the event store answers
pub async fn health<E, P, C>(service: Data<QueryService<E, P, C>>) -> HttpResponse
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    match service.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse { ok: true }),
        Err(e) => {
            error!("Health check failed: {}", e);
            HttpResponse::InternalServerError().json(HealthResponse { ok: false })
        }
    }
}

/// Ex-VAT cost per plan across all recorded usage
#[instrument(skip_all, fields(subject = %admin.subject()))]
pub async fn totals<E, P, C>(
    admin: AdminUser,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<Json<Vec<TotalCost>>>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    let totals = service.total_costs().await?;
    info!("Serving {} plan totals", totals.len());
    Ok(Json(totals))
}
