//! Usage, billable and forecast event handlers

use crate::dto::QueryParams;
use crate::handlers::stream::json_array_response;
use actix_web::{web::Data, HttpResponse};
use billing_auth::AuthenticatedUser;
use billing_core::{
    models::EventFilter,
    traits::{ConsolidationRepository, PricingConfigRepository, RawEventRepository},
    AppError, AppResult,
};
use billing_services::{constants::DUMMY_ORG_GUID, QueryService};
use tracing::{debug, instrument};

/// Usage intervals for the requested range and organisations
///
/// ```text
/// GET /usage_events?range_start=2024-01-01&range_stop=2024-02-01&org_guid=...
/// ```
#[instrument(skip_all, fields(subject = %user.subject()))]
pub async fn usage_events<E, P, C>(
    user: AuthenticatedUser,
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<HttpResponse>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    user.authorize_orgs(&params.org_guids)?;
    let filter = params.filter()?;
    debug!("Usage events for {:?}", filter);

    let rows = service.usage_events(&filter).await?;
    json_array_response(rows).await
}

/// Priced events for the requested range and organisations
///
/// ```text
/// GET /billable_events?range_start=2024-01-01&range_stop=2024-02-01&org_guid=...
/// ```
#[instrument(skip_all, fields(subject = %user.subject()))]
pub async fn billable_events<E, P, C>(
    user: AuthenticatedUser,
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<HttpResponse>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    user.authorize_orgs(&params.org_guids)?;
    let filter = params.filter()?;
    debug!("Billable events for {:?}", filter);

    let rows = service.billable_events(&filter).await?;
    json_array_response(rows).await
}

/// Price hypothetical usage for the forecast organisation
///
/// ```text
/// GET /forecast_events?range_start=...&range_stop=...&events=[...]
/// ```
#[instrument(skip_all)]
pub async fn forecast_events<E, P, C>(
    params: QueryParams,
    service: Data<QueryService<E, P, C>>,
) -> AppResult<HttpResponse>
where
    E: RawEventRepository + 'static,
    P: PricingConfigRepository + 'static,
    C: ConsolidationRepository + 'static,
{
    if params.org_guids.iter().any(|org| org != DUMMY_ORG_GUID) {
        return Err(AppError::Forbidden);
    }

    let range = params.filter()?.range();
    let filter = EventFilter::new(range, vec![DUMMY_ORG_GUID.to_string()]);
    let events = params.forecast_events()?;
    debug!("Forecasting {} events", events.len());

    let rows = service.forecast_billable_events(events, &filter).await?;
    json_array_response(rows).await
}
