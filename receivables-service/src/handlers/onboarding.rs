use crate::dtos::{BaselineSeedRequest, BaselineSeedResponse, ListResponse};
use crate::middleware::TenantContext;
use crate::models::DriverCylinderBaseline;
use crate::services::DriverBaselines;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

/// One-time seeding of the tenant's starting cylinder debt.
pub async fn seed_baselines(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<BaselineSeedRequest>,
) -> Result<(StatusCode, Json<BaselineSeedResponse>), AppError> {
    payload.validate()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        as_of = %payload.as_of,
        drivers = payload.drivers.len(),
        user_id = ?tenant.user_id,
        "Seeding driver baselines"
    );

    let drivers: Vec<DriverBaselines> = payload.drivers.into_iter().map(Into::into).collect();
    let seed = state
        .baselines
        .seed(tenant.tenant_id, payload.as_of, &drivers)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(BaselineSeedResponse {
            tenant_id: seed.tenant_id,
            baseline_date: seed.baseline_date,
            baselines: seed.baselines,
        }),
    ))
}

pub async fn list_driver_baselines(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(driver_id): Path<Uuid>,
) -> Result<Json<ListResponse<DriverCylinderBaseline>>, AppError> {
    let baselines = state
        .baselines
        .baselines(tenant.tenant_id, driver_id)
        .await?;
    Ok(Json(baselines.into()))
}
