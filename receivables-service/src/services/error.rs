//! Domain error taxonomy for receivables-service.

use crate::models::LedgerKey;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReceivablesError {
    /// Client-correctable input problem, reported before anything is written.
    #[error("Invalid settlement: {field}: {reason}")]
    InvalidSettlement { field: String, reason: String },

    #[error(
        "Insufficient inventory for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientInventory {
        product_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Ledger recompute failed for {key}: {message}")]
    ConsistencyRecomputeFailure { key: LedgerKey, message: String },

    #[error("Baselines already seeded for tenant {tenant_id}: {reason}")]
    DuplicateBaselineSeed { tenant_id: Uuid, reason: String },

    /// Optimistic version check lost against a concurrent writer.
    #[error("Concurrent update of ledger snapshot {0}")]
    VersionConflict(LedgerKey),

    #[error(transparent)]
    App(#[from] AppError),
}

impl ReceivablesError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSettlement {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VersionConflict(_) => true,
            Self::App(AppError::DatabaseError(_))
            | Self::App(AppError::InternalError(_))
            | Self::App(AppError::ServiceUnavailable) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for ReceivablesError {
    fn from(err: sqlx::Error) -> Self {
        Self::App(AppError::DatabaseError(anyhow::Error::new(err)))
    }
}

impl From<ReceivablesError> for AppError {
    fn from(err: ReceivablesError) -> Self {
        match err {
            ReceivablesError::InvalidSettlement { field, reason } => {
                AppError::InvalidInput { field, reason }
            }
            e @ ReceivablesError::InsufficientInventory { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            e @ ReceivablesError::NotFound { .. } => {
                AppError::NotFound(anyhow::anyhow!(e.to_string()))
            }
            e @ ReceivablesError::DuplicateBaselineSeed { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            e @ ReceivablesError::VersionConflict(_) => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            e @ ReceivablesError::ConsistencyRecomputeFailure { .. } => {
                AppError::InternalError(anyhow::anyhow!(e.to_string()))
            }
            ReceivablesError::App(e) => e,
        }
    }
}

pub type ReceivablesResult<T> = Result<T, ReceivablesError>;
