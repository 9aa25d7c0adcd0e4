//! Ledger snapshot recompute and read operations.

use crate::models::{
    CustomerAggregation, CustomerReceivable, CustomerReceivableFilter, InventoryReceivable,
    LedgerKey, ReceivableRecord, SnapshotUpsert,
};
use crate::services::calculator::{compute, daily_changes};
use crate::services::debt_tracker::aggregate_by_customer;
use crate::services::error::{ReceivablesError, ReceivablesResult};
use crate::services::store::ReceivablesStore;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Longest range `history` will return in one call.
pub const MAX_HISTORY_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// The snapshot was written with new values.
    Updated(SnapshotUpsert),
    /// Stored values were already correct, or there is nothing to record.
    Unchanged(Option<ReceivableRecord>),
}

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn ReceivablesStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn ReceivablesStore>) -> Self {
        Self { store }
    }

    /// Rebuild the snapshot for `key` from the persisted sale records and
    /// baselines of that day and the latest earlier snapshot.
    ///
    /// Idempotent: running it again without new data changes nothing. The
    /// write is a version check against the row read here, so a concurrent
    /// writer surfaces as `VersionConflict` for the caller to retry.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn recompute(&self, key: LedgerKey) -> ReceivablesResult<RecomputeOutcome> {
        let current = self.store.get_snapshot(key).await?;
        let previous = self.store.get_latest_before(key).await?;
        let records = self.store.sale_records_for_day(key).await?;
        let baselines = self.store.baselines_for_day(key).await?;

        if current.is_none() && records.is_empty() && baselines.is_empty() {
            debug!("No activity and no snapshot, nothing to write");
            return Ok(RecomputeOutcome::Unchanged(None));
        }

        let changes = daily_changes(&records, &baselines);
        let totals = compute(previous.as_ref(), &changes);

        if let Some(row) = current.as_ref() {
            if totals.matches(row) {
                debug!(version = row.version, "Snapshot already up to date");
                return Ok(RecomputeOutcome::Unchanged(current));
            }
        }

        let expected_version = Some(current.as_ref().map(|r| r.version).unwrap_or(0));
        let written = self
            .store
            .upsert_snapshot(&totals.into_write(key, expected_version))
            .await?;

        let record = &written.record;
        info!(
            version = record.version,
            cash_change = %record.cash_receivables_change,
            cylinder_change = record.cylinder_receivables_change,
            total_cash = %record.total_cash_receivables,
            total_cylinders = record.total_cylinder_receivables,
            cascaded = ?written.cascaded.map(|k| k.date),
            "Ledger snapshot updated"
        );

        Ok(RecomputeOutcome::Updated(written))
    }

    /// The driver's balances on `key.date`: the day's own row if it exists,
    /// otherwise the latest earlier totals carried forward with zero change.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn snapshot(&self, key: LedgerKey) -> ReceivablesResult<ReceivableRecord> {
        self.ensure_driver(key.tenant_id, key.driver_id).await?;

        if let Some(record) = self.store.get_snapshot(key).await? {
            return Ok(record);
        }
        let previous = self.store.get_latest_before(key).await?;
        Ok(ReceivableRecord::carried_forward(key, previous.as_ref()))
    }

    /// Stored snapshots of a driver between two dates, inclusive.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, driver_id = %driver_id))]
    pub async fn history(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ReceivablesResult<Vec<ReceivableRecord>> {
        if from > to {
            return Err(ReceivablesError::invalid("from", "after_to"));
        }
        if (to - from).num_days() >= MAX_HISTORY_DAYS {
            return Err(ReceivablesError::invalid("to", "range_too_long"));
        }
        self.ensure_driver(tenant_id, driver_id).await?;

        self.store
            .list_snapshots(tenant_id, driver_id, from, to)
            .await
    }

    pub async fn customer_receivables(
        &self,
        tenant_id: Uuid,
        filter: &CustomerReceivableFilter,
    ) -> ReceivablesResult<Vec<CustomerReceivable>> {
        self.store.list_customer_receivables(tenant_id, filter).await
    }

    /// Open receivables per customer label. The status filter is ignored:
    /// aggregations only ever count open rows.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn customer_aggregations(
        &self,
        tenant_id: Uuid,
        filter: &CustomerReceivableFilter,
    ) -> ReceivablesResult<Vec<CustomerAggregation>> {
        let filter = CustomerReceivableFilter {
            status: None,
            ..filter.clone()
        };
        let receivables = self
            .store
            .list_customer_receivables(tenant_id, &filter)
            .await?;
        Ok(aggregate_by_customer(&receivables))
    }

    pub async fn inventory_receivables(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> ReceivablesResult<Vec<InventoryReceivable>> {
        self.store.list_inventory_receivables(tenant_id, date).await
    }

    async fn ensure_driver(&self, tenant_id: Uuid, driver_id: Uuid) -> ReceivablesResult<()> {
        let found = self.store.existing_drivers(tenant_id, &[driver_id]).await?;
        if found.contains(&driver_id) {
            Ok(())
        } else {
            Err(ReceivablesError::not_found("Driver", driver_id))
        }
    }
}
