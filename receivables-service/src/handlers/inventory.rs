use crate::dtos::{InventoryQuery, ListResponse};
use crate::middleware::TenantContext;
use crate::models::InventoryReceivable;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use service_core::error::AppError;

/// Empty cylinders owed to the tenant per product and size on one day.
pub async fn get_inventory_receivables(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<InventoryQuery>,
) -> Result<Json<ListResponse<InventoryReceivable>>, AppError> {
    let receivables = state
        .ledger
        .inventory_receivables(tenant.tenant_id, query.date)
        .await?;
    Ok(Json(receivables.into()))
}
