//! Customer debt tracker: per-customer open balances left by settlements.

use crate::models::{
    CustomerAggregation, CustomerReceivable, CylinderSize, ReceivableStatus, ReceivableType,
    SaleRecord, Settlement, SettlementTotals,
};
use chrono::{DateTime, Days, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_GRACE_DAYS: u32 = 30;

/// Receivables a settlement leaves behind: one CASH row when the customer paid
/// less than the net value, one CYLINDER row per size with unreturned empties.
pub fn build_customer_receivables(
    settlement: &Settlement,
    sale_records: &[SaleRecord],
    totals: &SettlementTotals,
    grace_days: u32,
    created_utc: DateTime<Utc>,
) -> Vec<CustomerReceivable> {
    let due_date = settlement
        .sale_date
        .checked_add_days(Days::new(u64::from(grace_days)))
        .unwrap_or(settlement.sale_date);

    let new_receivable = |receivable_type, cylinder_size, amount, quantity| CustomerReceivable {
        receivable_id: Uuid::new_v4(),
        tenant_id: settlement.tenant_id,
        driver_id: settlement.driver_id,
        settlement_id: settlement.settlement_id,
        customer_label: settlement.customer_label.trim().to_string(),
        receivable_type,
        cylinder_size,
        amount,
        quantity,
        due_date,
        status: ReceivableStatus::Current,
        created_utc,
    };

    let mut receivables = Vec::new();

    if totals.cash_deposited < totals.net_value {
        receivables.push(new_receivable(
            ReceivableType::Cash,
            None,
            totals.net_value - totals.cash_deposited,
            0,
        ));
    }

    let mut shortfall_by_size: BTreeMap<&CylinderSize, i64> = BTreeMap::new();
    for record in sale_records {
        let shortfall = record.cylinder_shortfall();
        if shortfall > 0 {
            *shortfall_by_size.entry(&record.cylinder_size).or_insert(0) += shortfall;
        }
    }
    for (size, quantity) in shortfall_by_size {
        receivables.push(new_receivable(
            ReceivableType::Cylinder,
            Some(size.clone()),
            Decimal::ZERO,
            quantity,
        ));
    }

    receivables
}

/// Roll open receivables up per customer label, sorted by label.
pub fn aggregate_by_customer(receivables: &[CustomerReceivable]) -> Vec<CustomerAggregation> {
    let mut by_customer: BTreeMap<&str, CustomerAggregation> = BTreeMap::new();

    for receivable in receivables.iter().filter(|r| r.status.is_open()) {
        let agg = by_customer
            .entry(receivable.customer_label.as_str())
            .or_insert_with(|| CustomerAggregation {
                customer_label: receivable.customer_label.clone(),
                open_cash: Decimal::ZERO,
                open_cylinders: 0,
                open_cylinders_by_size: BTreeMap::new(),
                receivable_count: 0,
                earliest_due_date: None,
            });

        match receivable.receivable_type {
            ReceivableType::Cash => agg.open_cash += receivable.amount,
            ReceivableType::Cylinder => {
                agg.open_cylinders += receivable.quantity;
                if let Some(size) = &receivable.cylinder_size {
                    *agg.open_cylinders_by_size.entry(size.clone()).or_insert(0) +=
                        receivable.quantity;
                }
            }
        }
        agg.receivable_count += 1;
        agg.earliest_due_date = Some(match agg.earliest_due_date {
            Some(d) => d.min(receivable.due_date),
            None => receivable.due_date,
        });
    }

    by_customer.into_values().collect()
}
