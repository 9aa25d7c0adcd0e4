//! Settlement allocation: expands a multi-item settlement into sale records.
//!
//! Everything here is pure. Money is carried at [`MONEY_SCALE`] decimal
//! places; apportioned amounts are rounded per share and the rounding residue
//! goes to the share with the largest base, so the parts always add up to
//! the whole.

use crate::models::{
    CylinderSize, ProductStock, SaleRecord, SaleType, Settlement, SettlementTotals,
};
use crate::services::error::{ReceivablesError, ReceivablesResult};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Decimal places of the currency's smallest unit.
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a money column (`NUMERIC(18, 2)`) can hold.
pub fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999_999_999, MONEY_SCALE)
}

fn too_large(field: impl Into<String>) -> ReceivablesError {
    ReceivablesError::invalid(field, "amount_too_large")
}

const MAX_CUSTOMER_LABEL_LEN: usize = 200;

/// Result of allocating a settlement.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub sale_records: Vec<SaleRecord>,
    pub totals: SettlementTotals,
}

/// Shape checks that need no stored data. Run before a transaction is opened.
pub fn validate_settlement(
    settlement: &Settlement,
    known_sizes: &BTreeSet<CylinderSize>,
) -> ReceivablesResult<()> {
    let label = settlement.customer_label.trim();
    if label.is_empty() {
        return Err(ReceivablesError::invalid("customer_label", "required"));
    }
    if label.len() > MAX_CUSTOMER_LABEL_LEN {
        return Err(ReceivablesError::invalid("customer_label", "too_long"));
    }

    if settlement.lines.is_empty() {
        return Err(ReceivablesError::invalid("lines", "required"));
    }

    check_money("discount", settlement.discount)?;
    check_money("cash_deposited", settlement.cash_deposited)?;

    let mut seen = HashSet::new();
    for (i, line) in settlement.lines.iter().enumerate() {
        if !seen.insert(line.product_id) {
            return Err(ReceivablesError::invalid(
                format!("lines[{}].product_id", i),
                "duplicate_product",
            ));
        }
        check_money(&format!("lines[{}].package_price", i), line.package_price)?;
        check_money(&format!("lines[{}].refill_price", i), line.refill_price)?;
        if line.package_qty > 0 && line.package_price <= Decimal::ZERO {
            return Err(ReceivablesError::invalid(
                format!("lines[{}].package_price", i),
                "must_be_positive",
            ));
        }
        if line.refill_qty > 0 && line.refill_price <= Decimal::ZERO {
            return Err(ReceivablesError::invalid(
                format!("lines[{}].refill_price", i),
                "must_be_positive",
            ));
        }
    }

    if settlement.lines.iter().all(|l| l.total_qty() == 0) {
        return Err(ReceivablesError::invalid("lines", "no_quantities"));
    }

    for size in settlement.cylinder_deposits.keys() {
        if !known_sizes.contains(size) {
            return Err(ReceivablesError::invalid(
                format!("cylinder_deposits.{}", size),
                "unknown_cylinder_size",
            ));
        }
    }

    Ok(())
}

fn check_money(field: &str, value: Decimal) -> ReceivablesResult<()> {
    if value < Decimal::ZERO {
        return Err(ReceivablesError::invalid(field, "must_not_be_negative"));
    }
    if value.normalize().scale() > MONEY_SCALE {
        return Err(ReceivablesError::invalid(field, "too_many_decimal_places"));
    }
    if value > max_amount() {
        return Err(too_large(field));
    }
    Ok(())
}

/// Fail with `InsufficientInventory` if any product's stock is below its
/// requested quantity. Products absent from `products` are left to
/// [`allocate`] to report.
pub fn check_inventory(
    settlement: &Settlement,
    products: &HashMap<Uuid, ProductStock>,
) -> ReceivablesResult<()> {
    for line in &settlement.lines {
        let requested = line.total_qty();
        if requested == 0 {
            continue;
        }
        if let Some(product) = products.get(&line.product_id) {
            if product.available_full < requested {
                return Err(ReceivablesError::InsufficientInventory {
                    product_id: line.product_id,
                    requested,
                    available: product.available_full,
                });
            }
        }
    }
    Ok(())
}

struct SubItem<'a> {
    product: &'a ProductStock,
    sale_type: SaleType,
    quantity: i64,
    unit_price: Decimal,
    gross: Decimal,
}

/// Split a settlement into one sale record per transacted (product, sale
/// type), apportioning discount and cash and matching deposited empties by
/// cylinder size.
pub fn allocate(
    settlement: &Settlement,
    products: &HashMap<Uuid, ProductStock>,
    created_utc: DateTime<Utc>,
) -> ReceivablesResult<Allocation> {
    // Line grosses and their package/refill parts, in request order.
    let mut lines = Vec::with_capacity(settlement.lines.len());
    for (i, line) in settlement.lines.iter().enumerate() {
        if line.total_qty() == 0 {
            continue;
        }
        let product = products.get(&line.product_id).ok_or_else(|| {
            ReceivablesError::invalid(format!("lines[{}].product_id", i), "product_not_found")
        })?;
        if product.tenant_id != settlement.tenant_id {
            return Err(ReceivablesError::invalid(
                format!("lines[{}].product_id", i),
                "product_not_found",
            ));
        }
        if !product.active {
            return Err(ReceivablesError::invalid(
                format!("lines[{}].product_id", i),
                "product_inactive",
            ));
        }

        let mut subs = Vec::with_capacity(2);
        if line.package_qty > 0 {
            subs.push(SubItem {
                product,
                sale_type: SaleType::Package,
                quantity: i64::from(line.package_qty),
                unit_price: line.package_price,
                gross: gross_of(line.package_qty, line.package_price)
                    .ok_or_else(|| too_large(format!("lines[{}].package_price", i)))?,
            });
        }
        if line.refill_qty > 0 {
            subs.push(SubItem {
                product,
                sale_type: SaleType::Refill,
                quantity: i64::from(line.refill_qty),
                unit_price: line.refill_price,
                gross: gross_of(line.refill_qty, line.refill_price)
                    .ok_or_else(|| too_large(format!("lines[{}].refill_price", i)))?,
            });
        }
        lines.push(subs);
    }

    if lines.is_empty() {
        return Err(ReceivablesError::invalid("lines", "no_valid_products"));
    }

    let line_grosses: Vec<Decimal> = lines
        .iter()
        .map(|subs| bounded_sum(subs.iter().map(|s| s.gross)))
        .collect::<Option<_>>()
        .ok_or_else(|| too_large("lines"))?;
    let total_value =
        bounded_sum(line_grosses.iter().copied()).ok_or_else(|| too_large("lines"))?;

    if total_value <= Decimal::ZERO {
        return Err(ReceivablesError::invalid("lines", "total_value_not_positive"));
    }
    let net_value = total_value - settlement.discount;
    if net_value < Decimal::ZERO {
        return Err(ReceivablesError::invalid("discount", "exceeds_total_value"));
    }

    // Discount: across lines by gross share, then within each line.
    let line_discounts =
        apportion(settlement.discount, &line_grosses).ok_or_else(|| too_large("discount"))?;
    let mut sub_items = Vec::new();
    let mut sub_discounts = Vec::new();
    for (subs, line_discount) in lines.into_iter().zip(line_discounts) {
        let weights: Vec<Decimal> = subs.iter().map(|s| s.gross).collect();
        sub_discounts
            .extend(apportion(line_discount, &weights).ok_or_else(|| too_large("discount"))?);
        sub_items.extend(subs);
    }

    let sub_nets: Vec<Decimal> = sub_items
        .iter()
        .zip(&sub_discounts)
        .map(|(s, d)| s.gross - *d)
        .collect();
    let sub_cash = apportion(settlement.cash_deposited, &sub_nets)
        .ok_or_else(|| too_large("cash_deposited"))?;

    // Deposited empties are matched to refills of the same size, in order.
    let mut remaining_deposits: BTreeMap<&CylinderSize, i64> = settlement
        .cylinder_deposits
        .iter()
        .map(|(size, count)| (size, i64::from(*count)))
        .collect();

    let mut totals = SettlementTotals {
        total_value,
        total_discount: settlement.discount,
        net_value,
        cash_deposited: settlement.cash_deposited,
        ..Default::default()
    };

    let mut sale_records = Vec::with_capacity(sub_items.len());
    for (i, sub) in sub_items.iter().enumerate() {
        let cylinders_deposited = match sub.sale_type {
            SaleType::Package => {
                totals.total_package_qty += sub.quantity;
                0
            }
            SaleType::Refill => {
                totals.total_refill_qty += sub.quantity;
                let matched = remaining_deposits
                    .get_mut(&sub.product.cylinder_size)
                    .map(|left| {
                        let taken = (*left).min(sub.quantity);
                        *left -= taken;
                        taken
                    })
                    .unwrap_or(0);
                totals.total_cylinder_deposits += matched;
                matched
            }
        };

        sale_records.push(SaleRecord {
            sale_id: Uuid::new_v4(),
            tenant_id: settlement.tenant_id,
            settlement_id: settlement.settlement_id,
            driver_id: settlement.driver_id,
            customer_label: settlement.customer_label.trim().to_string(),
            product_id: sub.product.product_id,
            cylinder_size: sub.product.cylinder_size.clone(),
            sale_type: sub.sale_type,
            payment_type: settlement.payment_type,
            sale_date: settlement.sale_date,
            quantity: sub.quantity,
            unit_price: sub.unit_price,
            gross_value: sub.gross,
            discount: sub_discounts[i],
            net_value: sub_nets[i],
            cash_deposited: sub_cash[i],
            cylinders_deposited,
            created_utc,
        });
    }

    Ok(Allocation {
        sale_records,
        totals,
    })
}

fn gross_of(quantity: u32, unit_price: Decimal) -> Option<Decimal> {
    Decimal::from(quantity)
        .checked_mul(unit_price)
        .filter(|gross| *gross <= max_amount())
}

/// Sum that fails instead of overflowing or leaving the money range.
fn bounded_sum(mut values: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    values
        .try_fold(Decimal::ZERO, |acc, v| acc.checked_add(v))
        .filter(|sum| *sum <= max_amount())
}

/// Split `total` across `weights` proportionally. Shares are rounded to
/// [`MONEY_SCALE`]; the residue lands on the largest weight. All-zero
/// weights yield all-zero shares. `None` if the arithmetic overflows.
pub fn apportion(total: Decimal, weights: &[Decimal]) -> Option<Vec<Decimal>> {
    let weight_sum = weights
        .iter()
        .try_fold(Decimal::ZERO, |acc, w| acc.checked_add(*w))?;
    if weights.is_empty() || weight_sum <= Decimal::ZERO {
        return Some(vec![Decimal::ZERO; weights.len()]);
    }

    let mut shares = weights
        .iter()
        .map(|w| {
            // Exact product first; very large amounts go through the ratio.
            let share = match total.checked_mul(*w) {
                Some(product) => product.checked_div(weight_sum),
                None => w.checked_div(weight_sum)?.checked_mul(total),
            }?;
            Some(share.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero))
        })
        .collect::<Option<Vec<Decimal>>>()?;

    let allocated = bounded_sum(shares.iter().copied())?;
    let residue = total.checked_sub(allocated)?;
    if !residue.is_zero() {
        let largest = weights
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        shares[largest] += residue;
    }

    Some(shares)
}
