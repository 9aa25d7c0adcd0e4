//! Baseline seeder: one-time starting cylinder debt per driver and size.

use crate::models::{
    BaselineSource, CylinderSize, DriverCylinderBaseline, InventoryReceivableDelta, LedgerKey,
    OnboardingSeed, SnapshotWrite,
};
use crate::services::error::{ReceivablesError, ReceivablesResult};
use crate::services::store::ReceivablesStore;
use crate::workers::RecomputeQueue;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Starting quantities for one driver.
#[derive(Debug, Clone)]
pub struct DriverBaselines {
    pub driver_id: Uuid,
    pub quantities: BTreeMap<CylinderSize, i64>,
}

/// Build everything an onboarding writes.
///
/// Day zero is the day before `as_of`. Only positive quantities produce
/// baseline rows; each driver with any gets a day-zero snapshot carrying the
/// baseline as both change and total, and the per-size sums across drivers
/// become product-less inventory receivables.
pub fn build_seed(
    tenant_id: Uuid,
    as_of: NaiveDate,
    drivers: &[DriverBaselines],
    created_utc: DateTime<Utc>,
) -> ReceivablesResult<OnboardingSeed> {
    let baseline_date = as_of
        .pred_opt()
        .ok_or_else(|| ReceivablesError::invalid("as_of", "out_of_range"))?;

    let mut seen = HashSet::new();
    let mut baselines = Vec::new();
    let mut snapshots = Vec::new();
    let mut per_size: BTreeMap<CylinderSize, i64> = BTreeMap::new();

    for (i, driver) in drivers.iter().enumerate() {
        if !seen.insert(driver.driver_id) {
            return Err(ReceivablesError::invalid(
                format!("drivers[{}].driver_id", i),
                "duplicate_driver",
            ));
        }

        let mut driver_total = 0i64;
        for (size, quantity) in &driver.quantities {
            if *quantity < 0 {
                return Err(ReceivablesError::invalid(
                    format!("drivers[{}].quantities.{}", i, size),
                    "must_not_be_negative",
                ));
            }
            if *quantity == 0 {
                continue;
            }
            baselines.push(DriverCylinderBaseline {
                baseline_id: Uuid::new_v4(),
                tenant_id,
                driver_id: driver.driver_id,
                cylinder_size: size.clone(),
                baseline_quantity: *quantity,
                baseline_date,
                source: BaselineSource::Onboarding,
                created_utc,
            });
            driver_total += quantity;
            *per_size.entry(size.clone()).or_insert(0) += quantity;
        }

        if driver_total > 0 {
            snapshots.push(SnapshotWrite {
                key: LedgerKey::new(tenant_id, driver.driver_id, baseline_date),
                cash_receivables_change: Decimal::ZERO,
                cylinder_receivables_change: driver_total,
                total_cash_receivables: Decimal::ZERO,
                total_cylinder_receivables: driver_total,
                expected_version: None,
            });
        }
    }

    let inventory_receivables = per_size
        .into_iter()
        .map(|(cylinder_size, increment)| InventoryReceivableDelta {
            tenant_id,
            record_date: baseline_date,
            product_id: None,
            cylinder_size,
            increment,
        })
        .collect();

    Ok(OnboardingSeed {
        tenant_id,
        baseline_date,
        baselines,
        snapshots,
        inventory_receivables,
    })
}

#[derive(Clone)]
pub struct BaselineSeeder {
    store: Arc<dyn ReceivablesStore>,
    queue: RecomputeQueue,
}

impl BaselineSeeder {
    pub fn new(store: Arc<dyn ReceivablesStore>, queue: RecomputeQueue) -> Self {
        Self { store, queue }
    }

    /// Seed a tenant's baselines. Runs once; a second call fails with
    /// `DuplicateBaselineSeed` and changes nothing.
    #[instrument(skip(self, drivers), fields(tenant_id = %tenant_id, as_of = %as_of, driver_count = drivers.len()))]
    pub async fn seed(
        &self,
        tenant_id: Uuid,
        as_of: NaiveDate,
        drivers: &[DriverBaselines],
    ) -> ReceivablesResult<OnboardingSeed> {
        let ids: Vec<Uuid> = drivers.iter().map(|d| d.driver_id).collect();
        let found = self.store.existing_drivers(tenant_id, &ids).await?;
        if let Some(missing) = ids.iter().find(|id| !found.contains(id)) {
            return Err(ReceivablesError::not_found("Driver", missing));
        }

        let known_sizes = self.store.known_cylinder_sizes(tenant_id).await?;
        for (i, driver) in drivers.iter().enumerate() {
            if let Some(size) = driver.quantities.keys().find(|s| !known_sizes.contains(*s)) {
                return Err(ReceivablesError::invalid(
                    format!("drivers[{}].quantities.{}", i, size),
                    "unknown_cylinder_size",
                ));
            }
        }

        let seed = build_seed(tenant_id, as_of, drivers, Utc::now())?;
        let queued = self.store.seed_onboarding(&seed).await?;
        for key in &queued {
            self.queue.submit(*key);
        }

        info!(
            baselines = seed.baselines.len(),
            recomputes = queued.len(),
            baseline_date = %seed.baseline_date,
            "Tenant baselines seeded"
        );

        Ok(seed)
    }

    pub async fn baselines(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>> {
        let found = self.store.existing_drivers(tenant_id, &[driver_id]).await?;
        if !found.contains(&driver_id) {
            return Err(ReceivablesError::not_found("Driver", driver_id));
        }
        self.store.list_baselines(tenant_id, driver_id).await
    }
}
