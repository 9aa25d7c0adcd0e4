//! Storage abstraction for receivables-service.
//!
//! [`ReceivablesStore`] is implemented by the Postgres [`Database`] and by the
//! in-memory [`MemoryStore`]. Settlement writes go through a [`SettlementTx`]
//! so that everything a settlement produces commits or rolls back together.
//!
//! [`Database`]: crate::services::database::Database
//! [`MemoryStore`]: crate::services::memory::MemoryStore

use crate::models::{
    CustomerReceivable, CustomerReceivableFilter, CylinderSize, DriverCylinderBaseline,
    InventoryMovement, InventoryReceivable, InventoryReceivableDelta, LedgerKey, OnboardingSeed,
    ProductStock, ReceivableRecord, SaleRecord, SnapshotUpsert, SnapshotWrite,
};
use crate::services::error::ReceivablesResult;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// One open settlement transaction. Dropping it without [`commit`] rolls back.
///
/// [`commit`]: SettlementTx::commit
#[async_trait]
pub trait SettlementTx: Send {
    async fn driver_exists(&mut self, tenant_id: Uuid, driver_id: Uuid)
        -> ReceivablesResult<bool>;

    /// Fetch the products and lock their inventory rows until commit.
    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> ReceivablesResult<HashMap<Uuid, ProductStock>>;

    async fn insert_sale_records(&mut self, records: &[SaleRecord]) -> ReceivablesResult<()>;

    /// Record movements and apply them to product stock.
    async fn apply_movements(&mut self, movements: &[InventoryMovement]) -> ReceivablesResult<()>;

    async fn increment_inventory_receivables(
        &mut self,
        deltas: &[InventoryReceivableDelta],
    ) -> ReceivablesResult<()>;

    async fn insert_customer_receivables(
        &mut self,
        receivables: &[CustomerReceivable],
    ) -> ReceivablesResult<()>;

    /// Write the recompute outbox row for `key`, refreshing its enqueue time
    /// if one is already pending.
    async fn enqueue_recompute(&mut self, key: LedgerKey) -> ReceivablesResult<()>;

    async fn commit(self: Box<Self>) -> ReceivablesResult<()>;
}

#[async_trait]
pub trait ReceivablesStore: Send + Sync {
    async fn health_check(&self) -> ReceivablesResult<()>;

    // Settlements

    async fn begin_settlement(&self) -> ReceivablesResult<Box<dyn SettlementTx>>;

    /// Cylinder sizes of the tenant's products.
    async fn known_cylinder_sizes(&self, tenant_id: Uuid)
        -> ReceivablesResult<BTreeSet<CylinderSize>>;

    async fn existing_drivers(
        &self,
        tenant_id: Uuid,
        driver_ids: &[Uuid],
    ) -> ReceivablesResult<HashSet<Uuid>>;

    async fn sale_records_for_day(&self, key: LedgerKey) -> ReceivablesResult<Vec<SaleRecord>>;

    // Ledger snapshots

    /// Latest snapshot of the driver strictly before `key.date`.
    async fn get_latest_before(&self, key: LedgerKey)
        -> ReceivablesResult<Option<ReceivableRecord>>;

    async fn get_snapshot(&self, key: LedgerKey) -> ReceivablesResult<Option<ReceivableRecord>>;

    /// Insert or update one snapshot, honouring `write.expected_version`.
    /// The driver's next later snapshot, if any, is enqueued for recompute
    /// in the same transaction. Fails with `VersionConflict` when the check
    /// does not hold.
    async fn upsert_snapshot(&self, write: &SnapshotWrite) -> ReceivablesResult<SnapshotUpsert>;

    /// Snapshots with `from <= date <= to`, oldest first.
    async fn list_snapshots(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ReceivablesResult<Vec<ReceivableRecord>>;

    // Recompute outbox

    /// Pending keys, oldest enqueue first.
    async fn pending_recomputes(&self, limit: i64) -> ReceivablesResult<Vec<LedgerKey>>;

    /// Ticket of the pending outbox row for `key`, if there is one. Every
    /// enqueue of a key issues a fresh ticket.
    async fn claim_recompute(&self, key: LedgerKey) -> ReceivablesResult<Option<i64>>;

    /// Delete the outbox row for `key` if it still holds `ticket`. A row
    /// re-enqueued after the claim survives.
    async fn clear_recompute(&self, key: LedgerKey, ticket: i64) -> ReceivablesResult<()>;

    // Customer receivables

    async fn list_customer_receivables(
        &self,
        tenant_id: Uuid,
        filter: &CustomerReceivableFilter,
    ) -> ReceivablesResult<Vec<CustomerReceivable>>;

    // Baselines

    /// Write a whole onboarding seed and mark the tenant onboarded. Fails
    /// with `DuplicateBaselineSeed` if the tenant is already onboarded or a
    /// baseline for any (driver, size) exists.
    ///
    /// In the same transaction every seeded snapshot and the driver's next
    /// later snapshot are enqueued for recompute; those keys are returned.
    async fn seed_onboarding(&self, seed: &OnboardingSeed) -> ReceivablesResult<Vec<LedgerKey>>;

    async fn list_baselines(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>>;

    async fn baselines_for_day(
        &self,
        key: LedgerKey,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>>;

    async fn list_inventory_receivables(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> ReceivablesResult<Vec<InventoryReceivable>>;
}
