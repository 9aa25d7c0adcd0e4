//! In-memory store backend.
//!
//! Used for local runs and tests. A settlement transaction holds the state
//! lock for its whole lifetime and works on a staged copy, so concurrent
//! settlements serialize and an uncommitted transaction leaves no trace.

use crate::models::{
    CustomerReceivable, CustomerReceivableFilter, CylinderSize, DriverCylinderBaseline,
    InventoryMovement, InventoryReceivable, InventoryReceivableDelta, LedgerKey, OnboardingSeed,
    ProductStock, ReceivableRecord, SaleRecord, SnapshotUpsert, SnapshotWrite,
};
use crate::services::error::{ReceivablesError, ReceivablesResult};
use crate::services::store::{ReceivablesStore, SettlementTx};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

type InventoryReceivableKey = (Uuid, NaiveDate, Option<Uuid>, CylinderSize);

#[derive(Debug, Clone, Default)]
struct State {
    drivers: HashSet<(Uuid, Uuid)>,
    products: HashMap<Uuid, ProductStock>,
    sale_records: Vec<SaleRecord>,
    movements: Vec<InventoryMovement>,
    inventory_receivables: BTreeMap<InventoryReceivableKey, i64>,
    customer_receivables: Vec<CustomerReceivable>,
    snapshots: BTreeMap<LedgerKey, ReceivableRecord>,
    /// Pending keys and their tickets.
    outbox: HashMap<LedgerKey, i64>,
    last_ticket: i64,
    baselines: Vec<DriverCylinderBaseline>,
    onboarded: HashSet<Uuid>,
    /// Applied just before the next snapshot write is checked.
    racing_write: Option<SnapshotWrite>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    failing_snapshot_writes: Arc<AtomicU32>,
    write_gate: Arc<RwLock<()>>,
    writes_in_flight: Arc<AtomicU32>,
    peak_writes_in_flight: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver as master data.
    pub async fn add_driver(&self, tenant_id: Uuid, driver_id: Uuid) {
        self.state.lock().await.drivers.insert((tenant_id, driver_id));
    }

    /// Register or replace a product and its full-cylinder stock.
    pub async fn add_product(&self, product: ProductStock) {
        self.state
            .lock()
            .await
            .products
            .insert(product.product_id, product);
    }

    pub async fn available_full(&self, product_id: Uuid) -> Option<i64> {
        self.state
            .lock()
            .await
            .products
            .get(&product_id)
            .map(|p| p.available_full)
    }

    pub async fn movements(&self) -> Vec<InventoryMovement> {
        self.state.lock().await.movements.clone()
    }

    /// Make the next `count` snapshot writes fail with a transient error.
    pub fn fail_next_snapshot_writes(&self, count: u32) {
        self.failing_snapshot_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_snapshot_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Make the next snapshot write lose a race: `write` is stored
    /// unconditionally right before that write's version check.
    pub async fn race_next_snapshot_write(&self, write: SnapshotWrite) {
        self.state.lock().await.racing_write = Some(write);
    }

    /// Block snapshot writes until the returned guard is dropped.
    pub async fn hold_snapshot_writes(&self) -> OwnedRwLockWriteGuard<()> {
        self.write_gate.clone().write_owned().await
    }

    /// Snapshot writes currently started and not yet finished.
    pub fn snapshot_writes_in_flight(&self) -> u32 {
        self.writes_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of snapshot writes ever in flight at once.
    pub fn peak_snapshot_writes_in_flight(&self) -> u32 {
        self.peak_writes_in_flight.load(Ordering::SeqCst)
    }
}

fn enqueue(state: &mut State, key: LedgerKey) {
    state.last_ticket += 1;
    state.outbox.insert(key, state.last_ticket);
}

/// Enqueue the driver's next snapshot after `key`, if there is one.
fn cascade(state: &mut State, key: LedgerKey) -> Option<LedgerKey> {
    let (_, end) = driver_range(key.tenant_id, key.driver_id);
    let next = state
        .snapshots
        .range(key..=end)
        .map(|(k, _)| *k)
        .find(|k| k.date > key.date)?;
    enqueue(state, next);
    Some(next)
}

fn increment_receivables(state: &mut State, deltas: &[InventoryReceivableDelta]) {
    for delta in deltas {
        *state
            .inventory_receivables
            .entry((
                delta.tenant_id,
                delta.record_date,
                delta.product_id,
                delta.cylinder_size.clone(),
            ))
            .or_insert(0) += delta.increment;
    }
}

fn write_snapshot(
    state: &mut State,
    write: &SnapshotWrite,
) -> ReceivablesResult<ReceivableRecord> {
    let existing = state.snapshots.get(&write.key);
    let version_ok = match (write.expected_version, existing) {
        (None, _) => true,
        (Some(expected), Some(row)) => row.version == expected,
        (Some(expected), None) => expected == 0,
    };
    if !version_ok {
        return Err(ReceivablesError::VersionConflict(write.key));
    }

    let record = ReceivableRecord {
        tenant_id: write.key.tenant_id,
        driver_id: write.key.driver_id,
        record_date: write.key.date,
        cash_receivables_change: write.cash_receivables_change,
        cylinder_receivables_change: write.cylinder_receivables_change,
        total_cash_receivables: write.total_cash_receivables,
        total_cylinder_receivables: write.total_cylinder_receivables,
        version: existing.map(|r| r.version + 1).unwrap_or(1),
        updated_utc: Utc::now(),
    };
    state.snapshots.insert(write.key, record.clone());
    Ok(record)
}

fn driver_range(tenant_id: Uuid, driver_id: Uuid) -> (LedgerKey, LedgerKey) {
    (
        LedgerKey::new(tenant_id, driver_id, NaiveDate::MIN),
        LedgerKey::new(tenant_id, driver_id, NaiveDate::MAX),
    )
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl SettlementTx for MemoryTx {
    async fn driver_exists(
        &mut self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<bool> {
        Ok(self.staged.drivers.contains(&(tenant_id, driver_id)))
    }

    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> ReceivablesResult<HashMap<Uuid, ProductStock>> {
        Ok(product_ids
            .iter()
            .filter_map(|id| self.staged.products.get(id))
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| (p.product_id, p.clone()))
            .collect())
    }

    async fn insert_sale_records(&mut self, records: &[SaleRecord]) -> ReceivablesResult<()> {
        self.staged.sale_records.extend_from_slice(records);
        Ok(())
    }

    async fn apply_movements(&mut self, movements: &[InventoryMovement]) -> ReceivablesResult<()> {
        for movement in movements {
            let product = self
                .staged
                .products
                .get_mut(&movement.product_id)
                .ok_or_else(|| ReceivablesError::not_found("Product", movement.product_id))?;
            product.available_full -= movement.full_out;
        }
        self.staged.movements.extend_from_slice(movements);
        Ok(())
    }

    async fn increment_inventory_receivables(
        &mut self,
        deltas: &[InventoryReceivableDelta],
    ) -> ReceivablesResult<()> {
        increment_receivables(&mut self.staged, deltas);
        Ok(())
    }

    async fn insert_customer_receivables(
        &mut self,
        receivables: &[CustomerReceivable],
    ) -> ReceivablesResult<()> {
        self.staged
            .customer_receivables
            .extend_from_slice(receivables);
        Ok(())
    }

    async fn enqueue_recompute(&mut self, key: LedgerKey) -> ReceivablesResult<()> {
        enqueue(&mut self.staged, key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> ReceivablesResult<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl ReceivablesStore for MemoryStore {
    async fn health_check(&self) -> ReceivablesResult<()> {
        Ok(())
    }

    async fn begin_settlement(&self) -> ReceivablesResult<Box<dyn SettlementTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }

    async fn known_cylinder_sizes(
        &self,
        tenant_id: Uuid,
    ) -> ReceivablesResult<BTreeSet<CylinderSize>> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| p.cylinder_size.clone())
            .collect())
    }

    async fn existing_drivers(
        &self,
        tenant_id: Uuid,
        driver_ids: &[Uuid],
    ) -> ReceivablesResult<HashSet<Uuid>> {
        let state = self.state.lock().await;
        Ok(driver_ids
            .iter()
            .copied()
            .filter(|d| state.drivers.contains(&(tenant_id, *d)))
            .collect())
    }

    async fn sale_records_for_day(&self, key: LedgerKey) -> ReceivablesResult<Vec<SaleRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .sale_records
            .iter()
            .filter(|r| {
                r.tenant_id == key.tenant_id
                    && r.driver_id == key.driver_id
                    && r.sale_date == key.date
            })
            .cloned()
            .collect())
    }

    async fn get_latest_before(
        &self,
        key: LedgerKey,
    ) -> ReceivablesResult<Option<ReceivableRecord>> {
        let state = self.state.lock().await;
        let (start, _) = driver_range(key.tenant_id, key.driver_id);
        Ok(state
            .snapshots
            .range(start..key)
            .next_back()
            .map(|(_, r)| r.clone()))
    }

    async fn get_snapshot(&self, key: LedgerKey) -> ReceivablesResult<Option<ReceivableRecord>> {
        Ok(self.state.lock().await.snapshots.get(&key).cloned())
    }

    async fn upsert_snapshot(&self, write: &SnapshotWrite) -> ReceivablesResult<SnapshotUpsert> {
        let in_flight = self.writes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_writes_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let result: ReceivablesResult<SnapshotUpsert> = async {
            let _open = self.write_gate.read().await;
            if self.take_injected_failure() {
                return Err(AppError::ServiceUnavailable.into());
            }

            let mut state = self.state.lock().await;
            if let Some(race) = state.racing_write.take() {
                write_snapshot(
                    &mut state,
                    &SnapshotWrite {
                        expected_version: None,
                        ..race
                    },
                )?;
            }
            let record = write_snapshot(&mut state, write)?;
            let cascaded = cascade(&mut state, write.key);
            Ok(SnapshotUpsert { record, cascaded })
        }
        .await;

        self.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_snapshots(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ReceivablesResult<Vec<ReceivableRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .range(LedgerKey::new(tenant_id, driver_id, from)..=LedgerKey::new(tenant_id, driver_id, to))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn pending_recomputes(&self, limit: i64) -> ReceivablesResult<Vec<LedgerKey>> {
        let state = self.state.lock().await;
        let mut pending: Vec<(i64, LedgerKey)> =
            state.outbox.iter().map(|(k, ticket)| (*ticket, *k)).collect();
        pending.sort();
        Ok(pending
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(_, k)| k)
            .collect())
    }

    async fn claim_recompute(&self, key: LedgerKey) -> ReceivablesResult<Option<i64>> {
        Ok(self.state.lock().await.outbox.get(&key).copied())
    }

    async fn clear_recompute(&self, key: LedgerKey, ticket: i64) -> ReceivablesResult<()> {
        let mut state = self.state.lock().await;
        if state.outbox.get(&key) == Some(&ticket) {
            state.outbox.remove(&key);
        }
        Ok(())
    }

    async fn list_customer_receivables(
        &self,
        tenant_id: Uuid,
        filter: &CustomerReceivableFilter,
    ) -> ReceivablesResult<Vec<CustomerReceivable>> {
        let state = self.state.lock().await;
        Ok(state
            .customer_receivables
            .iter()
            .filter(|r| r.tenant_id == tenant_id && filter.matches(r))
            .cloned()
            .collect())
    }

    async fn seed_onboarding(&self, seed: &OnboardingSeed) -> ReceivablesResult<Vec<LedgerKey>> {
        let mut state = self.state.lock().await;

        if state.onboarded.contains(&seed.tenant_id) {
            return Err(ReceivablesError::DuplicateBaselineSeed {
                tenant_id: seed.tenant_id,
                reason: "tenant onboarding already completed".to_string(),
            });
        }
        for baseline in &seed.baselines {
            let exists = state.baselines.iter().any(|b| {
                b.tenant_id == baseline.tenant_id
                    && b.driver_id == baseline.driver_id
                    && b.cylinder_size == baseline.cylinder_size
            });
            if exists {
                return Err(ReceivablesError::DuplicateBaselineSeed {
                    tenant_id: seed.tenant_id,
                    reason: format!(
                        "baseline for driver {} size {} exists",
                        baseline.driver_id, baseline.cylinder_size
                    ),
                });
            }
        }

        // Validate all snapshot writes before touching anything.
        let mut staged = state.clone();
        let mut queued = Vec::new();
        for write in &seed.snapshots {
            write_snapshot(&mut staged, write)?;
            enqueue(&mut staged, write.key);
            queued.push(write.key);
            queued.extend(cascade(&mut staged, write.key));
        }
        staged.baselines.extend_from_slice(&seed.baselines);
        increment_receivables(&mut staged, &seed.inventory_receivables);
        staged.onboarded.insert(seed.tenant_id);

        *state = staged;
        Ok(queued)
    }

    async fn list_baselines(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>> {
        let state = self.state.lock().await;
        let mut baselines: Vec<DriverCylinderBaseline> = state
            .baselines
            .iter()
            .filter(|b| b.tenant_id == tenant_id && b.driver_id == driver_id)
            .cloned()
            .collect();
        baselines.sort_by(|a, b| a.cylinder_size.cmp(&b.cylinder_size));
        Ok(baselines)
    }

    async fn baselines_for_day(
        &self,
        key: LedgerKey,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>> {
        let state = self.state.lock().await;
        Ok(state
            .baselines
            .iter()
            .filter(|b| {
                b.tenant_id == key.tenant_id
                    && b.driver_id == key.driver_id
                    && b.baseline_date == key.date
            })
            .cloned()
            .collect())
    }

    async fn list_inventory_receivables(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> ReceivablesResult<Vec<InventoryReceivable>> {
        let state = self.state.lock().await;
        Ok(state
            .inventory_receivables
            .iter()
            .filter(|((t, d, _, _), _)| *t == tenant_id && *d == date)
            .map(|((t, d, p, size), count)| InventoryReceivable {
                tenant_id: *t,
                record_date: *d,
                product_id: *p,
                cylinder_size: size.clone(),
                empty_cylinder_receivables: *count,
            })
            .collect())
    }
}
