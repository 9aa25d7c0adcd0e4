use crate::dtos::{CustomerQuery, ListResponse};
use crate::middleware::TenantContext;
use crate::models::{CustomerAggregation, CustomerReceivable, CustomerReceivableFilter};
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use service_core::error::AppError;
use validator::Validate;

/// Open cash and cylinder debt per customer label.
pub async fn get_aggregations(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<ListResponse<CustomerAggregation>>, AppError> {
    query.validate()?;
    let filter = CustomerReceivableFilter::from(query);
    let aggregations = state
        .ledger
        .customer_aggregations(tenant.tenant_id, &filter)
        .await?;
    Ok(Json(aggregations.into()))
}

pub async fn list_receivables(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<ListResponse<CustomerReceivable>>, AppError> {
    query.validate()?;
    let filter = CustomerReceivableFilter::from(query);
    let receivables = state
        .ledger
        .customer_receivables(tenant.tenant_id, &filter)
        .await?;
    Ok(Json(receivables.into()))
}
