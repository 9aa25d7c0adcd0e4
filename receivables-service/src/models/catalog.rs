//! Read-only master data consumed from the catalog subsystem.

use crate::models::CylinderSize;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A product together with its current full-cylinder stock, as read (and
/// locked) inside a settlement transaction.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub cylinder_size: CylinderSize,
    pub active: bool,
    pub available_full: i64,
}
