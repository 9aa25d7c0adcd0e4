//! Integration tests against a real PostgreSQL store.
//!
//! Run with `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

mod common;

use common::money;
use common::postgres::spawn_pg_app;
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn settlement_commits_stock_sales_and_receivables() {
    let app = spawn_pg_app().await;

    let body = json!({
        "driver_id": app.driver_id,
        "customer_label": "Hotel Baraka",
        "sale_date": "2024-08-01",
        "payment_type": "CASH",
        "lines": [
            {"product_id": app.product_a, "package_qty": 2, "refill_qty": 3,
             "package_price": "500", "refill_price": "300"},
            {"product_id": app.product_b, "refill_qty": 1, "refill_price": "300"}
        ],
        "discount": "100",
        "cash_deposited": "1000",
        "cylinder_deposits": {"12L": 2}
    });

    let response = app.submit_settlement(&body).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    assert_eq!(app.available_full(app.product_a).await, 95);
    assert_eq!(app.available_full(app.product_b).await, 99);
    assert_eq!(app.count("sale_records").await, 3);
    assert_eq!(app.count("customer_receivables").await, 2);

    let snapshot = app
        .wait_for_snapshot("2024-08-01", |s| s["total_cylinder_receivables"] == 2)
        .await;
    assert_eq!(money(&snapshot["total_cash_receivables"]), 1100.0);
    assert_eq!(snapshot["version"], 1);
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn insufficient_stock_rolls_back_everything() {
    let app = spawn_pg_app().await;

    let response = app
        .submit_settlement(&app.refill_settlement("2024-08-01", 101, 0, "0"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    assert_eq!(app.available_full(app.product_a).await, 100);
    assert_eq!(app.count("sale_records").await, 0);
    assert_eq!(app.count("inventory_movements").await, 0);
    assert_eq!(app.count("customer_receivables").await, 0);
    assert_eq!(app.count("ledger_recompute_queue").await, 0);
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn back_dated_settlement_cascades_to_later_snapshots() {
    let app = spawn_pg_app().await;

    app.submit_settlement(&app.refill_settlement("2024-08-05", 1, 0, "0"))
        .await;
    app.wait_for_snapshot("2024-08-05", |s| s["total_cylinder_receivables"] == 1)
        .await;

    app.submit_settlement(&app.refill_settlement("2024-08-02", 2, 0, "0"))
        .await;

    let later = app
        .wait_for_snapshot("2024-08-05", |s| s["total_cylinder_receivables"] == 3)
        .await;
    assert_eq!(money(&later["total_cash_receivables"]), 900.0);
    assert_eq!(money(&later["cash_receivables_change"]), 300.0);
    assert_eq!(later["version"], 2);

    let earlier = app.snapshot("2024-08-02").await;
    assert_eq!(money(&earlier["total_cash_receivables"]), 600.0);
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn repeated_recompute_keeps_version_and_drains_outbox() {
    let app = spawn_pg_app().await;

    app.submit_settlement(&app.refill_settlement("2024-08-01", 2, 0, "100"))
        .await;
    let first = app
        .wait_for_snapshot("2024-08-01", |s| s["total_cylinder_receivables"] == 2)
        .await;

    // Let the outbox sweep run a couple of times.
    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;

    let second = app.snapshot("2024-08-01").await;
    assert_eq!(first["version"], second["version"]);
    assert_eq!(money(&second["total_cash_receivables"]), 500.0);
    assert_eq!(app.count("ledger_recompute_queue").await, 0);
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn baseline_seed_is_once_per_tenant_and_immutable() {
    let app = spawn_pg_app().await;
    let body = json!({
        "as_of": "2024-09-01",
        "drivers": [{"driver_id": app.driver_id, "baselines": {"12L": 5}}]
    });

    let first = app.post("/onboarding/baselines").json(&body).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = app.post("/onboarding/baselines").json(&body).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);

    let day_zero = app.snapshot("2024-08-31").await;
    assert_eq!(day_zero["total_cylinder_receivables"], 5);

    let completed: bool =
        sqlx::query_scalar("SELECT completed FROM tenant_onboarding WHERE tenant_id = $1")
            .bind(app.tenant_id)
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert!(completed);

    let update = sqlx::query(
        "UPDATE driver_cylinder_baselines SET baseline_quantity = 9 WHERE tenant_id = $1",
    )
    .bind(app.tenant_id)
    .execute(app.db.pool())
    .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM driver_cylinder_baselines WHERE tenant_id = $1")
        .bind(app.tenant_id)
        .execute(app.db.pool())
        .await;
    assert!(delete.is_err());
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn product_less_inventory_rows_are_unique_per_day_and_size() {
    let app = spawn_pg_app().await;
    let body = json!({
        "as_of": "2024-09-01",
        "drivers": [{"driver_id": app.driver_id, "baselines": {"12L": 5}}]
    });
    let response = app.post("/onboarding/baselines").json(&body).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let duplicate = sqlx::query(
        r#"
        INSERT INTO inventory_receivables
            (tenant_id, record_date, product_id, cylinder_size, empty_cylinder_receivables)
        VALUES ($1, '2024-08-31', NULL, '12L', 1)
        "#,
    )
    .bind(app.tenant_id)
    .execute(app.db.pool())
    .await;
    assert!(duplicate.is_err());

    let inventory: Value = app
        .get("/inventory/receivables?date=2024-08-31")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inventory["count"], 1);
    assert_eq!(inventory["items"][0]["product_id"], Value::Null);
    assert_eq!(inventory["items"][0]["empty_cylinder_receivables"], 5);
}

#[tokio::test]
#[ignore] // Requires database - set TEST_DATABASE_URL
async fn concurrent_first_seeds_admit_exactly_one() {
    let app = spawn_pg_app().await;

    let other_driver = Uuid::new_v4();
    sqlx::query("INSERT INTO drivers (tenant_id, driver_id) VALUES ($1, $2)")
        .bind(app.tenant_id)
        .bind(other_driver)
        .execute(app.db.pool())
        .await
        .unwrap();

    let seed = |driver_id: Uuid| {
        app.post("/onboarding/baselines")
            .json(&json!({
                "as_of": "2024-09-01",
                "drivers": [{"driver_id": driver_id, "baselines": {"12L": 2}}]
            }))
            .send()
    };

    let (first, second) = tokio::join!(seed(app.driver_id), seed(other_driver));
    let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);
    assert_eq!(app.count("driver_cylinder_baselines").await, 1);
}
