//! Driver ledger snapshot and size-indexed inventory receivable models.

use crate::models::CylinderSize;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Identifies one ledger snapshot: a driver's receivables on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    pub date: NaiveDate,
}

impl LedgerKey {
    pub fn new(tenant_id: Uuid, driver_id: Uuid, date: NaiveDate) -> Self {
        Self {
            tenant_id,
            driver_id,
            date,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.driver_id, self.date)
    }
}

/// Per-driver running balance for one day.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ReceivableRecord {
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    pub record_date: NaiveDate,
    pub cash_receivables_change: Decimal,
    pub cylinder_receivables_change: i64,
    pub total_cash_receivables: Decimal,
    pub total_cylinder_receivables: i64,
    pub version: i64,
    pub updated_utc: DateTime<Utc>,
}

impl ReceivableRecord {
    /// Read-side view of a day with no row of its own: balances carried from
    /// `previous` (or zero) with no change.
    pub fn carried_forward(key: LedgerKey, previous: Option<&ReceivableRecord>) -> Self {
        Self {
            tenant_id: key.tenant_id,
            driver_id: key.driver_id,
            record_date: key.date,
            cash_receivables_change: Decimal::ZERO,
            cylinder_receivables_change: 0,
            total_cash_receivables: previous
                .map(|p| p.total_cash_receivables)
                .unwrap_or(Decimal::ZERO),
            total_cylinder_receivables: previous
                .map(|p| p.total_cylinder_receivables)
                .unwrap_or(0),
            version: 0,
            updated_utc: previous.map(|p| p.updated_utc).unwrap_or_else(Utc::now),
        }
    }
}

/// Values to write for one snapshot key.
///
/// `expected_version` makes the write a compare-and-swap: `Some(0)` means the
/// row must not exist yet, `Some(n)` means the stored row must still be at
/// version `n`. `None` overwrites unconditionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub key: LedgerKey,
    pub cash_receivables_change: Decimal,
    pub cylinder_receivables_change: i64,
    pub total_cash_receivables: Decimal,
    pub total_cylinder_receivables: i64,
    pub expected_version: Option<i64>,
}

/// A written snapshot and the later snapshot queued behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpsert {
    pub record: ReceivableRecord,
    /// The driver's next later snapshot, enqueued for recompute in the same
    /// transaction as the write.
    pub cascaded: Option<LedgerKey>,
}

/// Size-indexed count of empties owed to the business on a date, across all
/// drivers. `product_id` is `None` for onboarding baselines.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct InventoryReceivable {
    pub tenant_id: Uuid,
    pub record_date: NaiveDate,
    pub product_id: Option<Uuid>,
    pub cylinder_size: CylinderSize,
    pub empty_cylinder_receivables: i64,
}

/// Additive change to an inventory receivable row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryReceivableDelta {
    pub tenant_id: Uuid,
    pub record_date: NaiveDate,
    pub product_id: Option<Uuid>,
    pub cylinder_size: CylinderSize,
    pub increment: i64,
}
