//! Request and response bodies for the HTTP API.

use crate::models::{
    CustomerReceivableFilter, CylinderSize, DriverCylinderBaseline, PaymentType,
    ReceivableStatus, ReceivableType, Settlement, SettlementLine,
};
use crate::services::DriverBaselines;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct SettlementRequest {
    pub driver_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub customer_label: String,
    /// Defaults to today (UTC).
    pub sale_date: Option<NaiveDate>,
    pub payment_type: PaymentType,
    #[validate(length(min = 1, max = 100))]
    pub lines: Vec<SettlementLineRequest>,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub cash_deposited: Decimal,
    #[serde(default)]
    pub cylinder_deposits: BTreeMap<CylinderSize, u32>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SettlementLineRequest {
    pub product_id: Uuid,
    #[serde(default)]
    pub package_qty: u32,
    #[serde(default)]
    pub refill_qty: u32,
    #[serde(default)]
    pub package_price: Decimal,
    #[serde(default)]
    pub refill_price: Decimal,
}

impl SettlementRequest {
    pub fn into_settlement(self, tenant_id: Uuid) -> Settlement {
        Settlement {
            settlement_id: Uuid::new_v4(),
            tenant_id,
            driver_id: self.driver_id,
            customer_label: self.customer_label,
            sale_date: self.sale_date.unwrap_or_else(|| Utc::now().date_naive()),
            payment_type: self.payment_type,
            lines: self
                .lines
                .into_iter()
                .map(|l| SettlementLine {
                    product_id: l.product_id,
                    package_qty: l.package_qty,
                    refill_qty: l.refill_qty,
                    package_price: l.package_price,
                    refill_price: l.refill_price,
                })
                .collect(),
            discount: self.discount,
            cash_deposited: self.cash_deposited,
            cylinder_deposits: self.cylinder_deposits,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CustomerQuery {
    pub driver_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub customer: Option<String>,
    pub status: Option<ReceivableStatus>,
    pub receivable_type: Option<ReceivableType>,
}

impl From<CustomerQuery> for CustomerReceivableFilter {
    fn from(query: CustomerQuery) -> Self {
        Self {
            driver_id: query.driver_id,
            customer: query.customer,
            status: query.status,
            receivable_type: query.receivable_type,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct BaselineSeedRequest {
    /// First day of live operation; baselines are dated the day before.
    pub as_of: NaiveDate,
    #[validate(length(min = 1, max = 1000))]
    pub drivers: Vec<DriverBaselineRequest>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DriverBaselineRequest {
    pub driver_id: Uuid,
    pub baselines: BTreeMap<CylinderSize, i64>,
}

impl From<DriverBaselineRequest> for DriverBaselines {
    fn from(request: DriverBaselineRequest) -> Self {
        Self {
            driver_id: request.driver_id,
            quantities: request.baselines,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BaselineSeedResponse {
    pub tenant_id: Uuid,
    pub baseline_date: NaiveDate,
    pub baselines: Vec<DriverCylinderBaseline>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub count: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}
