//! Per-customer open receivable models.

use crate::models::CylinderSize;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceivableType {
    Cash,
    Cylinder,
}

impl ReceivableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Cylinder => "CYLINDER",
        }
    }
}

/// Lifecycle of a customer receivable. The engine only ever writes
/// `Current`; the other transitions belong to payment collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceivableStatus {
    Current,
    Overdue,
    Paid,
}

impl ReceivableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "CURRENT",
            Self::Overdue => "OVERDUE",
            Self::Paid => "PAID",
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Paid)
    }
}

/// Uncollected cash or empties a customer owes from one settlement.
///
/// Cash rows carry `amount` with `quantity == 0`; cylinder rows carry
/// `cylinder_size` and `quantity` with `amount == 0`.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CustomerReceivable {
    pub receivable_id: Uuid,
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    pub settlement_id: Uuid,
    pub customer_label: String,
    pub receivable_type: ReceivableType,
    pub cylinder_size: Option<CylinderSize>,
    pub amount: Decimal,
    pub quantity: i64,
    pub due_date: NaiveDate,
    pub status: ReceivableStatus,
    pub created_utc: DateTime<Utc>,
}

/// Filters for customer receivable queries. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerReceivableFilter {
    pub driver_id: Option<Uuid>,
    pub customer: Option<String>,
    pub status: Option<ReceivableStatus>,
    pub receivable_type: Option<ReceivableType>,
}

impl CustomerReceivableFilter {
    pub fn matches(&self, receivable: &CustomerReceivable) -> bool {
        self.driver_id.map_or(true, |d| receivable.driver_id == d)
            && self
                .customer
                .as_deref()
                .map_or(true, |c| receivable.customer_label.eq_ignore_ascii_case(c))
            && self.status.map_or(true, |s| receivable.status == s)
            && self
                .receivable_type
                .map_or(true, |t| receivable.receivable_type == t)
    }
}

/// Open balance rollup for one customer label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerAggregation {
    pub customer_label: String,
    pub open_cash: Decimal,
    pub open_cylinders: i64,
    pub open_cylinders_by_size: BTreeMap<CylinderSize, i64>,
    pub receivable_count: i64,
    pub earliest_due_date: Option<NaiveDate>,
}
