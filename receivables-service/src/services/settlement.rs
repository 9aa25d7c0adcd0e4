//! Settlement submission: validate, allocate and persist in one transaction.

use crate::models::{
    CustomerReceivable, InventoryMovement, InventoryReceivableDelta, LedgerKey, SaleRecord,
    Settlement, SettlementTotals,
};
use crate::services::allocator::{allocate, check_inventory, validate_settlement};
use crate::services::debt_tracker::build_customer_receivables;
use crate::services::error::{ReceivablesError, ReceivablesResult};
use crate::services::metrics::{
    CUSTOMER_RECEIVABLES_TOTAL, ERRORS_TOTAL, SALE_RECORDS_TOTAL, SETTLEMENTS_TOTAL,
};
use crate::services::store::ReceivablesStore;
use crate::workers::RecomputeQueue;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SettlementResult {
    pub settlement_id: Uuid,
    pub sale_records: Vec<SaleRecord>,
    pub customer_receivables: Vec<CustomerReceivable>,
    pub totals: SettlementTotals,
}

#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn ReceivablesStore>,
    queue: RecomputeQueue,
    grace_days: u32,
}

impl SettlementService {
    pub fn new(store: Arc<dyn ReceivablesStore>, queue: RecomputeQueue, grace_days: u32) -> Self {
        Self {
            store,
            queue,
            grace_days,
        }
    }

    /// Persist a settlement and schedule the driver's ledger recompute.
    ///
    /// Nothing is written unless every check passes. The recompute is only
    /// queued once the transaction has committed, and its failure never
    /// affects the result returned here.
    #[instrument(
        skip(self, settlement),
        fields(
            tenant_id = %settlement.tenant_id,
            driver_id = %settlement.driver_id,
            settlement_id = %settlement.settlement_id,
            line_count = settlement.lines.len()
        )
    )]
    pub async fn submit(&self, settlement: Settlement) -> ReceivablesResult<SettlementResult> {
        let result = self.persist(&settlement).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(ReceivablesError::InvalidSettlement { .. }) => "invalid",
            Err(ReceivablesError::InsufficientInventory { .. }) => "insufficient_inventory",
            Err(ReceivablesError::NotFound { .. }) => "not_found",
            Err(_) => "error",
        };
        SETTLEMENTS_TOTAL.with_label_values(&[status]).inc();

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                if status == "error" {
                    ERRORS_TOTAL.with_label_values(&["settlement"]).inc();
                }
                warn!(error = %e, "Settlement rejected");
                return Err(e);
            }
        };

        let key = LedgerKey::new(settlement.tenant_id, settlement.driver_id, settlement.sale_date);
        self.queue.submit(key);

        for record in &result.sale_records {
            SALE_RECORDS_TOTAL
                .with_label_values(&[record.sale_type.as_str()])
                .inc();
        }
        for receivable in &result.customer_receivables {
            CUSTOMER_RECEIVABLES_TOTAL
                .with_label_values(&[receivable.receivable_type.as_str()])
                .inc();
        }

        info!(
            sale_records = result.sale_records.len(),
            customer_receivables = result.customer_receivables.len(),
            net_value = %result.totals.net_value,
            cash_deposited = %result.totals.cash_deposited,
            "Settlement recorded"
        );

        Ok(result)
    }

    async fn persist(&self, settlement: &Settlement) -> ReceivablesResult<SettlementResult> {
        let known_sizes = self
            .store
            .known_cylinder_sizes(settlement.tenant_id)
            .await?;
        validate_settlement(settlement, &known_sizes)?;

        let mut tx = self.store.begin_settlement().await?;

        if !tx
            .driver_exists(settlement.tenant_id, settlement.driver_id)
            .await?
        {
            return Err(ReceivablesError::not_found("Driver", settlement.driver_id));
        }

        let product_ids: Vec<Uuid> = settlement
            .lines
            .iter()
            .filter(|l| l.total_qty() > 0)
            .map(|l| l.product_id)
            .collect();
        let products = tx
            .lock_products(settlement.tenant_id, &product_ids)
            .await?;

        check_inventory(settlement, &products)?;

        let now = Utc::now();
        let allocation = allocate(settlement, &products, now)?;
        let customer_receivables = build_customer_receivables(
            settlement,
            &allocation.sale_records,
            &allocation.totals,
            self.grace_days,
            now,
        );
        let movements: Vec<InventoryMovement> = allocation
            .sale_records
            .iter()
            .map(InventoryMovement::for_sale)
            .collect();
        let deltas = inventory_receivable_deltas(&allocation.sale_records);

        tx.insert_sale_records(&allocation.sale_records).await?;
        tx.apply_movements(&movements).await?;
        tx.increment_inventory_receivables(&deltas).await?;
        tx.insert_customer_receivables(&customer_receivables).await?;
        tx.enqueue_recompute(LedgerKey::new(
            settlement.tenant_id,
            settlement.driver_id,
            settlement.sale_date,
        ))
        .await?;
        tx.commit().await?;

        Ok(SettlementResult {
            settlement_id: settlement.settlement_id,
            sale_records: allocation.sale_records,
            customer_receivables,
            totals: allocation.totals,
        })
    }
}

/// Empties owed per (product, size) on the sale date.
fn inventory_receivable_deltas(records: &[SaleRecord]) -> Vec<InventoryReceivableDelta> {
    let mut by_product: BTreeMap<Uuid, InventoryReceivableDelta> = BTreeMap::new();
    for record in records {
        let shortfall = record.cylinder_shortfall();
        if shortfall == 0 {
            continue;
        }
        by_product
            .entry(record.product_id)
            .or_insert_with(|| InventoryReceivableDelta {
                tenant_id: record.tenant_id,
                record_date: record.sale_date,
                product_id: Some(record.product_id),
                cylinder_size: record.cylinder_size.clone(),
                increment: 0,
            })
            .increment += shortfall;
    }
    by_product.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::models::{PaymentType, ProductStock, ReceivableType, SettlementLine};
    use crate::services::memory::MemoryStore;
    use crate::workers::ConsistencyWorker;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    struct Fixture {
        store: MemoryStore,
        service: SettlementService,
        tenant_id: Uuid,
        driver_id: Uuid,
        product: ProductStock,
    }

    async fn fixture(stock: i64) -> Fixture {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        let driver_id = Uuid::new_v4();
        let product = ProductStock {
            product_id: Uuid::new_v4(),
            tenant_id,
            name: "LPG 12L".to_string(),
            cylinder_size: "12L".parse().unwrap(),
            active: true,
            available_full: stock,
        };
        store.add_driver(tenant_id, driver_id).await;
        store.add_product(product.clone()).await;

        // Worker never started, so only the outbox row records the recompute.
        let (_worker, queue) = ConsistencyWorker::new(WorkerConfig::default(), Arc::new(store.clone()));
        let service = SettlementService::new(Arc::new(store.clone()), queue, 30);

        Fixture {
            store,
            service,
            tenant_id,
            driver_id,
            product,
        }
    }

    fn settlement(f: &Fixture, refill_qty: u32, deposits: u32, cash: i64) -> Settlement {
        Settlement {
            settlement_id: Uuid::new_v4(),
            tenant_id: f.tenant_id,
            driver_id: f.driver_id,
            customer_label: "Hotel Baraka".to_string(),
            sale_date: NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
            payment_type: PaymentType::MobileMoney,
            lines: vec![SettlementLine {
                product_id: f.product.product_id,
                package_qty: 0,
                refill_qty,
                package_price: Decimal::ZERO,
                refill_price: Decimal::from(300),
            }],
            discount: Decimal::ZERO,
            cash_deposited: Decimal::from(cash),
            cylinder_deposits: [("12L".parse().unwrap(), deposits)].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_everything() {
        let f = fixture(10).await;

        let result = f.service.submit(settlement(&f, 3, 1, 600)).await.unwrap();

        assert_eq!(result.sale_records.len(), 1);
        assert_eq!(result.totals.net_value, Decimal::from(900));
        assert_eq!(f.store.available_full(f.product.product_id).await, Some(7));

        let movements = f.store.movements().await;
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].full_out, 3);
        assert_eq!(movements[0].empty_in, 1);

        let types: Vec<ReceivableType> = result
            .customer_receivables
            .iter()
            .map(|r| r.receivable_type)
            .collect();
        assert_eq!(types, vec![ReceivableType::Cash, ReceivableType::Cylinder]);

        let date = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();
        let inventory = f.store.list_inventory_receivables(f.tenant_id, date).await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].empty_cylinder_receivables, 2);

        let key = LedgerKey::new(f.tenant_id, f.driver_id, date);
        assert_eq!(f.store.pending_recomputes(10).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_insufficient_inventory_writes_nothing() {
        let f = fixture(2).await;

        let err = f.service.submit(settlement(&f, 3, 0, 0)).await.unwrap_err();

        assert!(matches!(err, ReceivablesError::InsufficientInventory { .. }));
        assert_eq!(f.store.available_full(f.product.product_id).await, Some(2));
        assert!(f.store.movements().await.is_empty());
        assert!(f.store.pending_recomputes(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_driver_is_not_found() {
        let f = fixture(10).await;
        let mut s = settlement(&f, 1, 0, 0);
        s.driver_id = Uuid::new_v4();

        let err = f.service.submit(s).await.unwrap_err();
        assert!(matches!(err, ReceivablesError::NotFound { entity: "Driver", .. }));
    }

    #[test]
    fn test_inventory_deltas_group_by_product() {
        let product_id = Uuid::new_v4();
        let record = |quantity, deposited| SaleRecord {
            sale_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            settlement_id: Uuid::nil(),
            driver_id: Uuid::nil(),
            customer_label: "x".to_string(),
            product_id,
            cylinder_size: "6KG".parse().unwrap(),
            sale_type: crate::models::SaleType::Refill,
            payment_type: PaymentType::Cash,
            sale_date: NaiveDate::from_ymd_opt(2024, 8, 2).unwrap(),
            quantity,
            unit_price: Decimal::ONE,
            gross_value: Decimal::ONE,
            discount: Decimal::ZERO,
            net_value: Decimal::ONE,
            cash_deposited: Decimal::ONE,
            cylinders_deposited: deposited,
            created_utc: Utc::now(),
        };

        let deltas = inventory_receivable_deltas(&[record(4, 1), record(2, 2), record(1, 0)]);

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].increment, 4);
        assert_eq!(deltas[0].product_id, Some(product_id));
    }
}
