//! Onboarding baseline models.

use crate::models::{CylinderSize, InventoryReceivableDelta, SnapshotWrite};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineSource {
    Onboarding,
}

/// Starting cylinder debt of a driver for one size. Written once, never
/// updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DriverCylinderBaseline {
    pub baseline_id: Uuid,
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    pub cylinder_size: CylinderSize,
    pub baseline_quantity: i64,
    pub baseline_date: NaiveDate,
    pub source: BaselineSource,
    pub created_utc: DateTime<Utc>,
}

/// Everything the seeder writes for a tenant, in one transaction.
#[derive(Debug, Clone)]
pub struct OnboardingSeed {
    pub tenant_id: Uuid,
    pub baseline_date: NaiveDate,
    pub baselines: Vec<DriverCylinderBaseline>,
    pub snapshots: Vec<SnapshotWrite>,
    pub inventory_receivables: Vec<InventoryReceivableDelta>,
}
