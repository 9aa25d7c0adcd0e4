use crate::dtos::SettlementRequest;
use crate::middleware::TenantContext;
use crate::services::SettlementResult;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

/// Record a multi-item settlement for one driver and customer.
pub async fn submit_settlement(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<SettlementRequest>,
) -> Result<(StatusCode, Json<SettlementResult>), AppError> {
    payload.validate()?;

    let settlement = payload.into_settlement(tenant.tenant_id);

    tracing::info!(
        settlement_id = %settlement.settlement_id,
        tenant_id = %tenant.tenant_id,
        driver_id = %settlement.driver_id,
        user_id = ?tenant.user_id,
        "Submitting settlement"
    );

    let result = state.settlements.submit(settlement).await?;

    Ok((StatusCode::CREATED, Json(result)))
}
