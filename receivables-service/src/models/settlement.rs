//! Settlement request model.

use crate::models::CylinderSize;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How the customer paid. Recorded on every sale record; the arithmetic is
/// the same for all payment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Cash,
    Credit,
    MobileMoney,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::Credit => "CREDIT",
            Self::MobileMoney => "MOBILE_MONEY",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One product on a settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLine {
    pub product_id: Uuid,
    pub package_qty: u32,
    pub refill_qty: u32,
    pub package_price: Decimal,
    pub refill_price: Decimal,
}

impl SettlementLine {
    pub fn total_qty(&self) -> i64 {
        i64::from(self.package_qty) + i64::from(self.refill_qty)
    }
}

/// A customer transaction handled by one driver. Not persisted as such; it is
/// expanded into sale records by the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub settlement_id: Uuid,
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    pub customer_label: String,
    pub sale_date: NaiveDate,
    pub payment_type: PaymentType,
    pub lines: Vec<SettlementLine>,
    pub discount: Decimal,
    pub cash_deposited: Decimal,
    pub cylinder_deposits: BTreeMap<CylinderSize, u32>,
}

/// Aggregate figures for a settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTotals {
    pub total_value: Decimal,
    pub total_discount: Decimal,
    pub net_value: Decimal,
    pub cash_deposited: Decimal,
    pub total_package_qty: i64,
    pub total_refill_qty: i64,
    pub total_cylinder_deposits: i64,
}
