//! Sale record and inventory movement models.

use crate::models::{CylinderSize, PaymentType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Whether the customer took a new cylinder or exchanged an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleType {
    Package,
    Refill,
}

impl SaleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Package => "PACKAGE",
            Self::Refill => "REFILL",
        }
    }
}

impl std::fmt::Display for SaleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One transacted (product, sale type) of a settlement. Immutable once
/// written.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SaleRecord {
    pub sale_id: Uuid,
    pub tenant_id: Uuid,
    pub settlement_id: Uuid,
    pub driver_id: Uuid,
    pub customer_label: String,
    pub product_id: Uuid,
    pub cylinder_size: CylinderSize,
    pub sale_type: SaleType,
    pub payment_type: PaymentType,
    pub sale_date: NaiveDate,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub gross_value: Decimal,
    pub discount: Decimal,
    pub net_value: Decimal,
    pub cash_deposited: Decimal,
    pub cylinders_deposited: i64,
    pub created_utc: DateTime<Utc>,
}

impl SaleRecord {
    /// Empties still owed on this record. Zero for package sales.
    pub fn cylinder_shortfall(&self) -> i64 {
        match self.sale_type {
            SaleType::Package => 0,
            SaleType::Refill => (self.quantity - self.cylinders_deposited).max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    SalePackage,
    SaleRefill,
}

impl From<SaleType> for MovementKind {
    fn from(sale_type: SaleType) -> Self {
        match sale_type {
            SaleType::Package => Self::SalePackage,
            SaleType::Refill => Self::SaleRefill,
        }
    }
}

/// Stock movement emitted for the external inventory ledger.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub movement_id: Uuid,
    pub tenant_id: Uuid,
    pub product_id: Uuid,
    pub sale_id: Uuid,
    pub kind: MovementKind,
    pub movement_date: NaiveDate,
    pub full_out: i64,
    pub empty_in: i64,
}

impl InventoryMovement {
    pub fn for_sale(record: &SaleRecord) -> Self {
        Self {
            movement_id: Uuid::new_v4(),
            tenant_id: record.tenant_id,
            product_id: record.product_id,
            sale_id: record.sale_id,
            kind: record.sale_type.into(),
            movement_date: record.sale_date,
            full_out: record.quantity,
            empty_in: record.cylinders_deposited,
        }
    }
}
