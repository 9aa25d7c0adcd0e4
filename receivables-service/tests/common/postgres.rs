//! PostgreSQL-backed test harness.
//!
//! Requires `TEST_DATABASE_URL` (or `DATABASE_URL`) pointing at a scratch
//! database. Every app gets a fresh tenant, so tests can share one database.

use super::init_tracing;
use receivables_service::config::{DatabaseConfig, ReceivablesConfig, StoreBackend, WorkerConfig};
use receivables_service::services::Database;
use receivables_service::startup::Application;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct PgTestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub db: Database,
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    /// Two active 12L products.
    pub product_a: Uuid,
    pub product_b: Uuid,
}

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("TEST_DATABASE_URL or DATABASE_URL must be set to run PostgreSQL tests")
}

/// Spawn the service on a random port against PostgreSQL, with one driver and
/// two 12L products holding 100 full cylinders each.
pub async fn spawn_pg_app() -> PgTestApp {
    init_tracing();

    let database = DatabaseConfig {
        url: database_url(),
        max_connections: 5,
        min_connections: 1,
    };

    let mut config = ReceivablesConfig::in_memory();
    config.store = StoreBackend::Postgres;
    config.database = Some(database.clone());
    config.worker = WorkerConfig {
        queue_size: 64,
        max_retries: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 50,
        sweep_interval_secs: 1,
        sweep_batch_size: 100,
    };

    let db = Database::new(
        &database.url,
        database.max_connections,
        database.min_connections,
    )
    .await
    .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let tenant_id = Uuid::new_v4();
    let driver_id = Uuid::new_v4();
    sqlx::query("INSERT INTO drivers (tenant_id, driver_id, name) VALUES ($1, $2, $3)")
        .bind(tenant_id)
        .bind(driver_id)
        .bind("Test Driver")
        .execute(db.pool())
        .await
        .expect("Failed to insert driver");

    let product_a = add_pg_product(&db, tenant_id, "LPG 12L Total", "12L", 100).await;
    let product_b = add_pg_product(&db, tenant_id, "LPG 12L Oryx", "12L", 100).await;

    let app = Application::build_with_store(config, Arc::new(db.clone()))
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();
    let mut attempts = 0;
    loop {
        match client.get(format!("{}/ready", address)).send().await {
            Ok(response) if response.status().is_success() => break,
            _ if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            _ => panic!("Service did not become ready after 20 attempts"),
        }
    }

    PgTestApp {
        address,
        client,
        db,
        tenant_id,
        driver_id,
        product_a,
        product_b,
    }
}

pub async fn add_pg_product(
    db: &Database,
    tenant_id: Uuid,
    name: &str,
    size: &str,
    available_full: i64,
) -> Uuid {
    let product_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO products (tenant_id, product_id, name, cylinder_size) VALUES ($1, $2, $3, $4)",
    )
    .bind(tenant_id)
    .bind(product_id)
    .bind(name)
    .bind(size)
    .execute(db.pool())
    .await
    .expect("Failed to insert product");

    sqlx::query(
        "INSERT INTO product_inventory (tenant_id, product_id, available_full) VALUES ($1, $2, $3)",
    )
    .bind(tenant_id)
    .bind(product_id)
    .bind(available_full)
    .execute(db.pool())
    .await
    .expect("Failed to insert product inventory");

    product_id
}

impl PgTestApp {
    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", self.tenant_id.to_string())
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.address, path))
            .header("X-Tenant-ID", self.tenant_id.to_string())
    }

    pub async fn submit_settlement(&self, body: &Value) -> reqwest::Response {
        self.post("/settlements")
            .json(body)
            .send()
            .await
            .expect("Failed to send settlement")
    }

    /// Single refill line on product A.
    pub fn refill_settlement(&self, date: &str, qty: u32, deposits: u32, cash: &str) -> Value {
        json!({
            "driver_id": self.driver_id,
            "customer_label": "Mama Njeri Kiosk",
            "sale_date": date,
            "payment_type": "CASH",
            "lines": [
                {"product_id": self.product_a, "refill_qty": qty, "refill_price": "300"}
            ],
            "cash_deposited": cash,
            "cylinder_deposits": {"12L": deposits}
        })
    }

    pub async fn snapshot(&self, date: &str) -> Value {
        self.get(&format!("/drivers/{}/ledger/{}", self.driver_id, date))
            .send()
            .await
            .expect("Failed to fetch snapshot")
            .json()
            .await
            .expect("Snapshot body is not JSON")
    }

    /// Poll a snapshot until `ready` accepts it.
    pub async fn wait_for_snapshot(&self, date: &str, ready: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..100 {
            let snapshot = self.snapshot(date).await;
            if ready(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("Snapshot for {} never reached the expected state", date);
    }

    pub async fn available_full(&self, product_id: Uuid) -> i64 {
        sqlx::query_scalar(
            "SELECT available_full FROM product_inventory WHERE tenant_id = $1 AND product_id = $2",
        )
        .bind(self.tenant_id)
        .bind(product_id)
        .fetch_one(self.db.pool())
        .await
        .expect("Failed to read stock")
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE tenant_id = $1",
            table
        ))
        .bind(self.tenant_id)
        .fetch_one(self.db.pool())
        .await
        .expect("Failed to count rows")
    }
}
