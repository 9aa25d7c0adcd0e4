//! Postgres store for receivables-service.

use crate::models::{
    CustomerReceivable, CustomerReceivableFilter, CylinderSize, DriverCylinderBaseline,
    InventoryMovement, InventoryReceivable, InventoryReceivableDelta, LedgerKey, OnboardingSeed,
    ProductStock, ReceivableRecord, SaleRecord, SnapshotUpsert, SnapshotWrite,
};
use crate::services::error::{ReceivablesError, ReceivablesResult};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{ReceivablesStore, SettlementTx};
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SNAPSHOT_COLUMNS: &str = "tenant_id, driver_id, record_date, cash_receivables_change, \
     cylinder_receivables_change, total_cash_receivables, total_cylinder_receivables, version, updated_utc";

const SALE_RECORD_COLUMNS: &str = "sale_id, tenant_id, settlement_id, driver_id, customer_label, \
     product_id, cylinder_size, sale_type, payment_type, sale_date, quantity, unit_price, \
     gross_value, discount, net_value, cash_deposited, cylinders_deposited, created_utc";

const BASELINE_COLUMNS: &str = "baseline_id, tenant_id, driver_id, cylinder_size, \
     baseline_quantity, baseline_date, source, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &str, e: sqlx::Error) -> ReceivablesError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e)).into()
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "receivables-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

async fn upsert_snapshot_in<'e, E>(
    executor: E,
    write: &SnapshotWrite,
) -> ReceivablesResult<Option<ReceivableRecord>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = match write.expected_version {
        Some(0) => format!(
            r#"
            INSERT INTO receivable_records
                (tenant_id, driver_id, record_date, cash_receivables_change, cylinder_receivables_change,
                 total_cash_receivables, total_cylinder_receivables, version, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW())
            ON CONFLICT (tenant_id, driver_id, record_date) DO NOTHING
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ),
        Some(_) => format!(
            r#"
            UPDATE receivable_records
            SET cash_receivables_change = $4, cylinder_receivables_change = $5,
                total_cash_receivables = $6, total_cylinder_receivables = $7,
                version = version + 1, updated_utc = NOW()
            WHERE tenant_id = $1 AND driver_id = $2 AND record_date = $3 AND version = $8
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ),
        None => format!(
            r#"
            INSERT INTO receivable_records
                (tenant_id, driver_id, record_date, cash_receivables_change, cylinder_receivables_change,
                 total_cash_receivables, total_cylinder_receivables, version, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, NOW())
            ON CONFLICT (tenant_id, driver_id, record_date) DO UPDATE
            SET cash_receivables_change = EXCLUDED.cash_receivables_change,
                cylinder_receivables_change = EXCLUDED.cylinder_receivables_change,
                total_cash_receivables = EXCLUDED.total_cash_receivables,
                total_cylinder_receivables = EXCLUDED.total_cylinder_receivables,
                version = receivable_records.version + 1,
                updated_utc = NOW()
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ),
    };

    let mut query = sqlx::query_as::<_, ReceivableRecord>(&sql)
        .bind(write.key.tenant_id)
        .bind(write.key.driver_id)
        .bind(write.key.date)
        .bind(write.cash_receivables_change)
        .bind(write.cylinder_receivables_change)
        .bind(write.total_cash_receivables)
        .bind(write.total_cylinder_receivables);
    if let Some(expected) = write.expected_version.filter(|v| *v > 0) {
        query = query.bind(expected);
    }

    query
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("Failed to upsert ledger snapshot", e))
}

async fn increment_receivables_in(
    tx: &mut Transaction<'static, Postgres>,
    deltas: &[InventoryReceivableDelta],
) -> ReceivablesResult<()> {
    for delta in deltas {
        sqlx::query(
            r#"
            INSERT INTO inventory_receivables
                (tenant_id, record_date, product_id, cylinder_size, empty_cylinder_receivables)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, record_date, product_id, cylinder_size) DO UPDATE
            SET empty_cylinder_receivables =
                inventory_receivables.empty_cylinder_receivables + EXCLUDED.empty_cylinder_receivables
            "#,
        )
        .bind(delta.tenant_id)
        .bind(delta.record_date)
        .bind(delta.product_id)
        .bind(delta.cylinder_size.as_str())
        .bind(delta.increment)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to increment inventory receivable", e))?;
    }
    Ok(())
}

async fn enqueue_recompute_in<'e, E>(executor: E, key: LedgerKey) -> ReceivablesResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    // A re-enqueue draws a new ticket so an in-flight claim no longer matches.
    sqlx::query(
        r#"
        INSERT INTO ledger_recompute_queue (tenant_id, driver_id, record_date)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, driver_id, record_date) DO UPDATE
        SET ticket = nextval('ledger_recompute_ticket_seq'), enqueued_utc = clock_timestamp()
        "#,
    )
    .bind(key.tenant_id)
    .bind(key.driver_id)
    .bind(key.date)
    .execute(executor)
    .await
    .map_err(|e| db_error("Failed to enqueue recompute", e))?;
    Ok(())
}

async fn next_snapshot_date_in(
    tx: &mut Transaction<'static, Postgres>,
    key: LedgerKey,
) -> ReceivablesResult<Option<NaiveDate>> {
    sqlx::query_scalar(
        r#"
        SELECT MIN(record_date)
        FROM receivable_records
        WHERE tenant_id = $1 AND driver_id = $2 AND record_date > $3
        "#,
    )
    .bind(key.tenant_id)
    .bind(key.driver_id)
    .bind(key.date)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| db_error("Failed to fetch next snapshot date", e))
}

/// Enqueue the driver's next snapshot after `key`, if there is one.
async fn cascade_in(
    tx: &mut Transaction<'static, Postgres>,
    key: LedgerKey,
) -> ReceivablesResult<Option<LedgerKey>> {
    let Some(date) = next_snapshot_date_in(tx, key).await? else {
        return Ok(None);
    };
    let next = LedgerKey::new(key.tenant_id, key.driver_id, date);
    enqueue_recompute_in(&mut **tx, next).await?;
    Ok(Some(next))
}

/// Settlement transaction over a pooled connection.
pub struct PgSettlementTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SettlementTx for PgSettlementTx {
    async fn driver_exists(
        &mut self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM drivers WHERE tenant_id = $1 AND driver_id = $2 AND active)",
        )
        .bind(tenant_id)
        .bind(driver_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to check driver", e))?;
        Ok(exists)
    }

    #[instrument(skip(self, product_ids), fields(tenant_id = %tenant_id, product_count = product_ids.len()))]
    async fn lock_products(
        &mut self,
        tenant_id: Uuid,
        product_ids: &[Uuid],
    ) -> ReceivablesResult<HashMap<Uuid, ProductStock>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_products"])
            .start_timer();

        // Ordered row locks so concurrent settlements cannot deadlock.
        let stock: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT product_id, available_full
            FROM product_inventory
            WHERE tenant_id = $1 AND product_id = ANY($2)
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(product_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to lock inventory", e))?;
        let stock: HashMap<Uuid, i64> = stock.into_iter().collect();

        let products = sqlx::query_as::<_, ProductStock>(
            r#"
            SELECT product_id, tenant_id, name, cylinder_size, active, 0::BIGINT AS available_full
            FROM products
            WHERE tenant_id = $1 AND product_id = ANY($2)
            "#,
        )
        .bind(tenant_id)
        .bind(product_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("Failed to fetch products", e))?;

        timer.observe_duration();

        Ok(products
            .into_iter()
            .map(|mut p| {
                p.available_full = stock.get(&p.product_id).copied().unwrap_or(0);
                (p.product_id, p)
            })
            .collect())
    }

    async fn insert_sale_records(&mut self, records: &[SaleRecord]) -> ReceivablesResult<()> {
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO sale_records
                    (sale_id, tenant_id, settlement_id, driver_id, customer_label, product_id,
                     cylinder_size, sale_type, payment_type, sale_date, quantity, unit_price,
                     gross_value, discount, net_value, cash_deposited, cylinders_deposited, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                "#,
            )
            .bind(r.sale_id)
            .bind(r.tenant_id)
            .bind(r.settlement_id)
            .bind(r.driver_id)
            .bind(&r.customer_label)
            .bind(r.product_id)
            .bind(r.cylinder_size.as_str())
            .bind(r.sale_type.as_str())
            .bind(r.payment_type.as_str())
            .bind(r.sale_date)
            .bind(r.quantity)
            .bind(r.unit_price)
            .bind(r.gross_value)
            .bind(r.discount)
            .bind(r.net_value)
            .bind(r.cash_deposited)
            .bind(r.cylinders_deposited)
            .bind(r.created_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("Failed to insert sale record", e))?;
        }
        Ok(())
    }

    async fn apply_movements(&mut self, movements: &[InventoryMovement]) -> ReceivablesResult<()> {
        for m in movements {
            sqlx::query(
                r#"
                INSERT INTO inventory_movements
                    (movement_id, tenant_id, product_id, sale_id, kind, movement_date, full_out, empty_in)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(m.movement_id)
            .bind(m.tenant_id)
            .bind(m.product_id)
            .bind(m.sale_id)
            .bind(m.kind)
            .bind(m.movement_date)
            .bind(m.full_out)
            .bind(m.empty_in)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("Failed to insert inventory movement", e))?;

            sqlx::query(
                r#"
                UPDATE product_inventory
                SET available_full = available_full - $3,
                    available_empty = available_empty + $4,
                    updated_utc = NOW()
                WHERE tenant_id = $1 AND product_id = $2
                "#,
            )
            .bind(m.tenant_id)
            .bind(m.product_id)
            .bind(m.full_out)
            .bind(m.empty_in)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("Failed to update inventory", e))?;
        }
        Ok(())
    }

    async fn increment_inventory_receivables(
        &mut self,
        deltas: &[InventoryReceivableDelta],
    ) -> ReceivablesResult<()> {
        increment_receivables_in(&mut self.tx, deltas).await
    }

    async fn insert_customer_receivables(
        &mut self,
        receivables: &[CustomerReceivable],
    ) -> ReceivablesResult<()> {
        for r in receivables {
            sqlx::query(
                r#"
                INSERT INTO customer_receivables
                    (receivable_id, tenant_id, driver_id, settlement_id, customer_label, receivable_type,
                     cylinder_size, amount, quantity, due_date, status, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(r.receivable_id)
            .bind(r.tenant_id)
            .bind(r.driver_id)
            .bind(r.settlement_id)
            .bind(&r.customer_label)
            .bind(r.receivable_type.as_str())
            .bind(r.cylinder_size.as_ref().map(|s| s.as_str()))
            .bind(r.amount)
            .bind(r.quantity)
            .bind(r.due_date)
            .bind(r.status.as_str())
            .bind(r.created_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("Failed to insert customer receivable", e))?;
        }
        Ok(())
    }

    async fn enqueue_recompute(&mut self, key: LedgerKey) -> ReceivablesResult<()> {
        enqueue_recompute_in(&mut *self.tx, key).await
    }

    async fn commit(self: Box<Self>) -> ReceivablesResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))
    }
}

#[async_trait]
impl ReceivablesStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> ReceivablesResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;
        Ok(())
    }

    async fn begin_settlement(&self) -> ReceivablesResult<Box<dyn SettlementTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        Ok(Box::new(PgSettlementTx { tx }))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn known_cylinder_sizes(
        &self,
        tenant_id: Uuid,
    ) -> ReceivablesResult<BTreeSet<CylinderSize>> {
        let sizes: Vec<CylinderSize> = sqlx::query_scalar(
            "SELECT DISTINCT cylinder_size FROM products WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch cylinder sizes", e))?;
        Ok(sizes.into_iter().collect())
    }

    #[instrument(skip(self, driver_ids), fields(tenant_id = %tenant_id))]
    async fn existing_drivers(
        &self,
        tenant_id: Uuid,
        driver_ids: &[Uuid],
    ) -> ReceivablesResult<HashSet<Uuid>> {
        let found: Vec<Uuid> = sqlx::query_scalar(
            "SELECT driver_id FROM drivers WHERE tenant_id = $1 AND driver_id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(driver_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch drivers", e))?;
        Ok(found.into_iter().collect())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn sale_records_for_day(&self, key: LedgerKey) -> ReceivablesResult<Vec<SaleRecord>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sale_records_for_day"])
            .start_timer();

        let records = sqlx::query_as::<_, SaleRecord>(&format!(
            r#"
            SELECT {}
            FROM sale_records
            WHERE tenant_id = $1 AND driver_id = $2 AND sale_date = $3
            ORDER BY created_utc, sale_id
            "#,
            SALE_RECORD_COLUMNS
        ))
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch sale records", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_latest_before(
        &self,
        key: LedgerKey,
    ) -> ReceivablesResult<Option<ReceivableRecord>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_latest_before"])
            .start_timer();

        let record = sqlx::query_as::<_, ReceivableRecord>(&format!(
            r#"
            SELECT {}
            FROM receivable_records
            WHERE tenant_id = $1 AND driver_id = $2 AND record_date < $3
            ORDER BY record_date DESC
            LIMIT 1
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch previous snapshot", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_snapshot(&self, key: LedgerKey) -> ReceivablesResult<Option<ReceivableRecord>> {
        sqlx::query_as::<_, ReceivableRecord>(&format!(
            "SELECT {} FROM receivable_records WHERE tenant_id = $1 AND driver_id = $2 AND record_date = $3",
            SNAPSHOT_COLUMNS
        ))
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch snapshot", e))
    }

    #[instrument(skip(self, write), fields(key = %write.key, expected_version = ?write.expected_version))]
    async fn upsert_snapshot(&self, write: &SnapshotWrite) -> ReceivablesResult<SnapshotUpsert> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_snapshot"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let record = upsert_snapshot_in(&mut *tx, write)
            .await?
            .ok_or(ReceivablesError::VersionConflict(write.key))?;
        let cascaded = cascade_in(&mut tx, write.key).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;
        timer.observe_duration();

        Ok(SnapshotUpsert { record, cascaded })
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, driver_id = %driver_id))]
    async fn list_snapshots(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ReceivablesResult<Vec<ReceivableRecord>> {
        sqlx::query_as::<_, ReceivableRecord>(&format!(
            r#"
            SELECT {}
            FROM receivable_records
            WHERE tenant_id = $1 AND driver_id = $2 AND record_date BETWEEN $3 AND $4
            ORDER BY record_date
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(driver_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list snapshots", e))
    }

    async fn pending_recomputes(&self, limit: i64) -> ReceivablesResult<Vec<LedgerKey>> {
        let rows: Vec<(Uuid, Uuid, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT tenant_id, driver_id, record_date
            FROM ledger_recompute_queue
            ORDER BY ticket
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch pending recomputes", e))?;

        Ok(rows
            .into_iter()
            .map(|(t, d, date)| LedgerKey::new(t, d, date))
            .collect())
    }

    async fn claim_recompute(&self, key: LedgerKey) -> ReceivablesResult<Option<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT ticket
            FROM ledger_recompute_queue
            WHERE tenant_id = $1 AND driver_id = $2 AND record_date = $3
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to claim recompute", e))
    }

    async fn clear_recompute(&self, key: LedgerKey, ticket: i64) -> ReceivablesResult<()> {
        sqlx::query(
            r#"
            DELETE FROM ledger_recompute_queue
            WHERE tenant_id = $1 AND driver_id = $2 AND record_date = $3 AND ticket = $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .bind(ticket)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to clear recompute", e))?;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_customer_receivables(
        &self,
        tenant_id: Uuid,
        filter: &CustomerReceivableFilter,
    ) -> ReceivablesResult<Vec<CustomerReceivable>> {
        sqlx::query_as::<_, CustomerReceivable>(
            r#"
            SELECT receivable_id, tenant_id, driver_id, settlement_id, customer_label, receivable_type,
                   cylinder_size, amount, quantity, due_date, status, created_utc
            FROM customer_receivables
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR driver_id = $2)
              AND ($3::varchar IS NULL OR LOWER(customer_label) = LOWER($3))
              AND ($4::varchar IS NULL OR status = $4)
              AND ($5::varchar IS NULL OR receivable_type = $5)
            ORDER BY due_date, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(filter.driver_id)
        .bind(filter.customer.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.receivable_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list customer receivables", e))
    }

    #[instrument(skip(self, seed), fields(tenant_id = %seed.tenant_id, baseline_count = seed.baselines.len()))]
    async fn seed_onboarding(&self, seed: &OnboardingSeed) -> ReceivablesResult<Vec<LedgerKey>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["seed_onboarding"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Make sure the guard row exists, then lock it. A concurrent first
        // seed blocks on the insert until this transaction ends.
        sqlx::query(
            "INSERT INTO tenant_onboarding (tenant_id, completed) VALUES ($1, FALSE) ON CONFLICT (tenant_id) DO NOTHING",
        )
        .bind(seed.tenant_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to create onboarding flag", e))?;

        let completed: bool = sqlx::query_scalar(
            "SELECT completed FROM tenant_onboarding WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(seed.tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to read onboarding flag", e))?;

        if completed {
            return Err(ReceivablesError::DuplicateBaselineSeed {
                tenant_id: seed.tenant_id,
                reason: "tenant onboarding already completed".to_string(),
            });
        }

        for b in &seed.baselines {
            let result = sqlx::query(
                r#"
                INSERT INTO driver_cylinder_baselines
                    (baseline_id, tenant_id, driver_id, cylinder_size, baseline_quantity, baseline_date, source, created_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(b.baseline_id)
            .bind(b.tenant_id)
            .bind(b.driver_id)
            .bind(b.cylinder_size.as_str())
            .bind(b.baseline_quantity)
            .bind(b.baseline_date)
            .bind(b.source)
            .bind(b.created_utc)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                    warn!(driver_id = %b.driver_id, cylinder_size = %b.cylinder_size, "Baseline already exists");
                    return Err(ReceivablesError::DuplicateBaselineSeed {
                        tenant_id: seed.tenant_id,
                        reason: format!(
                            "baseline for driver {} size {} exists",
                            b.driver_id, b.cylinder_size
                        ),
                    });
                }
                Err(e) => return Err(db_error("Failed to insert baseline", e)),
            }
        }

        // Sales already recorded on or after day zero are rebased on the
        // baseline totals.
        let mut queued = Vec::new();
        for write in &seed.snapshots {
            if upsert_snapshot_in(&mut *tx, write).await?.is_none() {
                return Err(ReceivablesError::VersionConflict(write.key));
            }
            enqueue_recompute_in(&mut *tx, write.key).await?;
            queued.push(write.key);
            queued.extend(cascade_in(&mut tx, write.key).await?);
        }

        increment_receivables_in(&mut tx, &seed.inventory_receivables).await?;

        sqlx::query(
            r#"
            UPDATE tenant_onboarding
            SET completed = TRUE, baseline_date = $2, completed_utc = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(seed.tenant_id)
        .bind(seed.baseline_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to mark onboarding complete", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();

        info!(
            baseline_count = seed.baselines.len(),
            baseline_date = %seed.baseline_date,
            "Onboarding baselines seeded"
        );

        Ok(queued)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, driver_id = %driver_id))]
    async fn list_baselines(
        &self,
        tenant_id: Uuid,
        driver_id: Uuid,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>> {
        sqlx::query_as::<_, DriverCylinderBaseline>(&format!(
            "SELECT {} FROM driver_cylinder_baselines WHERE tenant_id = $1 AND driver_id = $2 ORDER BY cylinder_size",
            BASELINE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list baselines", e))
    }

    async fn baselines_for_day(
        &self,
        key: LedgerKey,
    ) -> ReceivablesResult<Vec<DriverCylinderBaseline>> {
        sqlx::query_as::<_, DriverCylinderBaseline>(&format!(
            r#"
            SELECT {}
            FROM driver_cylinder_baselines
            WHERE tenant_id = $1 AND driver_id = $2 AND baseline_date = $3
            "#,
            BASELINE_COLUMNS
        ))
        .bind(key.tenant_id)
        .bind(key.driver_id)
        .bind(key.date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch baselines", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, date = %date))]
    async fn list_inventory_receivables(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
    ) -> ReceivablesResult<Vec<InventoryReceivable>> {
        sqlx::query_as::<_, InventoryReceivable>(
            r#"
            SELECT tenant_id, record_date, product_id, cylinder_size, empty_cylinder_receivables
            FROM inventory_receivables
            WHERE tenant_id = $1 AND record_date = $2
            ORDER BY cylinder_size, product_id NULLS FIRST
            "#,
        )
        .bind(tenant_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list inventory receivables", e))
    }
}
