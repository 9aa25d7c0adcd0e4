//! Common test utilities for receivables-service integration tests.

#![allow(dead_code)]

pub mod postgres;

use receivables_service::config::{ReceivablesConfig, WorkerConfig};
use receivables_service::models::ProductStock;
use receivables_service::services::MemoryStore;
use receivables_service::startup::Application;
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,receivables_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: MemoryStore,
    pub tenant_id: Uuid,
    pub driver_id: Uuid,
    /// Two active 12L products.
    pub product_a: Uuid,
    pub product_b: Uuid,
}

/// Spawn the service on a random port over an in-memory store seeded with
/// one driver and two 12L products holding 100 full cylinders each.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let mut config = ReceivablesConfig::in_memory();
    config.worker = WorkerConfig {
        queue_size: 64,
        max_retries: 3,
        initial_backoff_ms: 5,
        max_backoff_ms: 50,
        sweep_interval_secs: 1,
        sweep_batch_size: 100,
    };

    let store = MemoryStore::new();
    let tenant_id = Uuid::new_v4();
    let driver_id = Uuid::new_v4();
    store.add_driver(tenant_id, driver_id).await;

    let product_a = add_product(&store, tenant_id, "LPG 12L Total", "12L", 100).await;
    let product_b = add_product(&store, tenant_id, "LPG 12L Oryx", "12L", 100).await;

    let app = Application::build_with_store(config, Arc::new(store.clone()))
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();
    let mut attempts = 0;
    loop {
        match client.get(format!("{}/health", address)).send().await {
            Ok(response) if response.status().is_success() => break,
            _ if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            _ => panic!("Service did not become healthy after 20 attempts"),
        }
    }

    TestApp {
        address,
        client,
        store,
        tenant_id,
        driver_id,
        product_a,
        product_b,
    }
}

pub async fn add_product(
    store: &MemoryStore,
    tenant_id: Uuid,
    name: &str,
    size: &str,
    available_full: i64,
) -> Uuid {
    let product_id = Uuid::new_v4();
    store
        .add_product(ProductStock {
            product_id,
            tenant_id,
            name: name.to_string(),
            cylinder_size: size.parse().expect("valid size"),
            active: true,
            available_full,
        })
        .await;
    product_id
}

impl TestApp {
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

    /// Poll the worker status of one snapshot until it reports DONE.
    pub async fn wait_for_recompute(&self, date: &str) -> Value {
        let path = format!("/drivers/{}/ledger/{}/recompute", self.driver_id, date);
        for _ in 0..100 {
            let response = self.get(&path).send().await.expect("Failed to fetch status");
            if response.status().is_success() {
                let status: Value = response.json().await.expect("Status body is not JSON");
                if status["state"] == "DONE" {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Recompute of {} did not finish", date);
    }

    /// Poll a snapshot until `ready` accepts it.
    pub async fn wait_for_snapshot(&self, date: &str, ready: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..100 {
            let snapshot = self.snapshot(date).await;
            if ready(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Snapshot for {} never reached the expected state", date);
    }
}

/// Money values are serialized as strings; compare them numerically.
pub fn money(value: &Value) -> f64 {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_f64())
        .unwrap_or_else(|| panic!("not a money value: {}", value))
}
