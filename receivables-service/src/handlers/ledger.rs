use crate::dtos::{HistoryQuery, ListResponse};
use crate::middleware::TenantContext;
use crate::models::{LedgerKey, ReceivableRecord};
use crate::startup::AppState;
use crate::workers::RecomputeStatus;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use service_core::error::AppError;
use uuid::Uuid;

/// A driver's receivables as of one day.
pub async fn get_snapshot(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path((driver_id, date)): Path<(Uuid, NaiveDate)>,
) -> Result<Json<ReceivableRecord>, AppError> {
    let key = LedgerKey::new(tenant.tenant_id, driver_id, date);
    let record = state.ledger.snapshot(key).await?;
    Ok(Json(record))
}

pub async fn get_history(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(driver_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ListResponse<ReceivableRecord>>, AppError> {
    let records = state
        .ledger
        .history(tenant.tenant_id, driver_id, query.from, query.to)
        .await?;
    Ok(Json(records.into()))
}

/// Where the background recompute of one snapshot stands.
pub async fn get_recompute_status(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path((driver_id, date)): Path<(Uuid, NaiveDate)>,
) -> Result<Json<RecomputeStatus>, AppError> {
    let key = LedgerKey::new(tenant.tenant_id, driver_id, date);
    state
        .queue
        .status(key)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No recompute recorded for {}", key)))
}
