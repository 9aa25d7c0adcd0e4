//! Receivables calculator: derives a day's ledger snapshot from the previous
//! cumulative balances and the day's persisted sale records.

use crate::models::{
    CylinderSize, DriverCylinderBaseline, LedgerKey, ReceivableRecord, SaleRecord, SnapshotWrite,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Net receivable changes for one driver on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyChanges {
    pub cash: Decimal,
    pub cylinders: i64,
    pub cylinders_by_size: BTreeMap<CylinderSize, i64>,
}

/// Computed snapshot values for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTotals {
    pub cash_change: Decimal,
    pub cylinder_change: i64,
    pub total_cash: Decimal,
    pub total_cylinders: i64,
}

impl LedgerTotals {
    pub fn into_write(self, key: LedgerKey, expected_version: Option<i64>) -> SnapshotWrite {
        SnapshotWrite {
            key,
            cash_receivables_change: self.cash_change,
            cylinder_receivables_change: self.cylinder_change,
            total_cash_receivables: self.total_cash,
            total_cylinder_receivables: self.total_cylinders,
            expected_version,
        }
    }

    /// Whether a stored row already holds these values.
    pub fn matches(&self, record: &ReceivableRecord) -> bool {
        record.cash_receivables_change == self.cash_change
            && record.cylinder_receivables_change == self.cylinder_change
            && record.total_cash_receivables == self.total_cash
            && record.total_cylinder_receivables == self.total_cylinders
    }
}

/// Sum the unresolved cash and empties of a day's sale records.
///
/// Each settlement contributes `max(0, net - cash)`; an overpaying customer
/// never reduces the driver's balance. Cylinder shortfalls are already floored
/// per record. Baselines dated on the day are added to the cylinder change.
pub fn daily_changes(
    records: &[SaleRecord],
    baselines: &[DriverCylinderBaseline],
) -> DailyChanges {
    let mut per_settlement: BTreeMap<Uuid, (Decimal, Decimal)> = BTreeMap::new();
    let mut changes = DailyChanges::default();

    for record in records {
        let entry = per_settlement
            .entry(record.settlement_id)
            .or_insert((Decimal::ZERO, Decimal::ZERO));
        entry.0 += record.net_value;
        entry.1 += record.cash_deposited;

        let shortfall = record.cylinder_shortfall();
        if shortfall > 0 {
            *changes
                .cylinders_by_size
                .entry(record.cylinder_size.clone())
                .or_insert(0) += shortfall;
        }
    }

    changes.cash = per_settlement
        .values()
        .map(|(net, cash)| (*net - *cash).max(Decimal::ZERO))
        .sum();

    for baseline in baselines {
        if baseline.baseline_quantity > 0 {
            *changes
                .cylinders_by_size
                .entry(baseline.cylinder_size.clone())
                .or_insert(0) += baseline.baseline_quantity;
        }
    }

    changes.cylinders = changes.cylinders_by_size.values().sum();
    changes
}

/// Roll `previous` forward by `changes`. No previous record means the totals
/// start from zero.
pub fn compute(previous: Option<&ReceivableRecord>, changes: &DailyChanges) -> LedgerTotals {
    let (prev_cash, prev_cylinders) = previous
        .map(|p| (p.total_cash_receivables, p.total_cylinder_receivables))
        .unwrap_or((Decimal::ZERO, 0));

    LedgerTotals {
        cash_change: changes.cash,
        cylinder_change: changes.cylinders,
        total_cash: prev_cash + changes.cash,
        total_cylinders: prev_cylinders + changes.cylinders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BaselineSource, PaymentType, SaleType};
    use chrono::{NaiveDate, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
    }

    fn record(
        settlement_id: Uuid,
        size: &str,
        sale_type: SaleType,
        quantity: i64,
        net: &str,
        cash: &str,
        deposited: i64,
    ) -> SaleRecord {
        SaleRecord {
            sale_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            settlement_id,
            driver_id: Uuid::nil(),
            customer_label: "Kiosk".to_string(),
            product_id: Uuid::nil(),
            cylinder_size: size.parse().unwrap(),
            sale_type,
            payment_type: PaymentType::Cash,
            sale_date: day(),
            quantity,
            unit_price: Decimal::ONE,
            gross_value: dec(net),
            discount: Decimal::ZERO,
            net_value: dec(net),
            cash_deposited: dec(cash),
            cylinders_deposited: deposited,
            created_utc: Utc::now(),
        }
    }

    fn previous(cash: &str, cylinders: i64) -> ReceivableRecord {
        ReceivableRecord {
            tenant_id: Uuid::nil(),
            driver_id: Uuid::nil(),
            record_date: day().pred_opt().unwrap(),
            cash_receivables_change: Decimal::ZERO,
            cylinder_receivables_change: 0,
            total_cash_receivables: dec(cash),
            total_cylinder_receivables: cylinders,
            version: 1,
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn test_overpayment_is_floored_per_settlement() {
        let owing = Uuid::new_v4();
        let overpaying = Uuid::new_v4();
        let records = vec![
            record(owing, "12L", SaleType::Package, 1, "500", "200", 0),
            record(overpaying, "12L", SaleType::Package, 1, "300", "400", 0),
        ];

        let changes = daily_changes(&records, &[]);

        assert_eq!(changes.cash, dec("300"));
        assert_eq!(changes.cylinders, 0);
    }

    #[test]
    fn test_cylinder_shortfall_by_size() {
        let s = Uuid::new_v4();
        let records = vec![
            record(s, "12L", SaleType::Refill, 3, "900", "900", 1),
            record(s, "6KG", SaleType::Refill, 2, "300", "300", 2),
            record(s, "6KG", SaleType::Package, 4, "800", "800", 0),
        ];

        let changes = daily_changes(&records, &[]);

        assert_eq!(changes.cash, Decimal::ZERO);
        assert_eq!(changes.cylinders, 2);
        assert_eq!(changes.cylinders_by_size.get(&"12L".parse().unwrap()), Some(&2));
        assert_eq!(changes.cylinders_by_size.get(&"6KG".parse().unwrap()), None);
    }

    #[test]
    fn test_baselines_fold_into_day() {
        let baseline = DriverCylinderBaseline {
            baseline_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            driver_id: Uuid::nil(),
            cylinder_size: "12L".parse().unwrap(),
            baseline_quantity: 5,
            baseline_date: day(),
            source: BaselineSource::Onboarding,
            created_utc: Utc::now(),
        };

        let changes = daily_changes(&[], &[baseline]);
        let totals = compute(None, &changes);

        assert_eq!(totals.cylinder_change, 5);
        assert_eq!(totals.total_cylinders, 5);
        assert_eq!(totals.total_cash, Decimal::ZERO);
    }

    #[test]
    fn test_compute_running_balance() {
        let changes = DailyChanges {
            cash: dec("150.50"),
            cylinders: 2,
            cylinders_by_size: BTreeMap::new(),
        };

        let first = compute(None, &changes);
        assert_eq!(first.total_cash, dec("150.50"));
        assert_eq!(first.total_cylinders, 2);

        let prev = previous("1000", 5);
        let next = compute(Some(&prev), &changes);
        assert_eq!(next.cash_change, dec("150.50"));
        assert_eq!(next.total_cash, dec("1150.50"));
        assert_eq!(next.total_cylinders, 7);
    }

    #[test]
    fn test_empty_day_carries_previous_totals() {
        let prev = previous("42", 3);
        let totals = compute(Some(&prev), &DailyChanges::default());

        assert_eq!(totals.cash_change, Decimal::ZERO);
        assert_eq!(totals.total_cash, dec("42"));
        assert_eq!(totals.total_cylinders, 3);
    }
}
