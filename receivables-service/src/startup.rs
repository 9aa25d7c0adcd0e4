//! Application startup and lifecycle management.

use crate::config::{ReceivablesConfig, StoreBackend};
use crate::handlers::{customers, health, inventory, ledger, onboarding, settlements};
use crate::services::{
    init_metrics, BaselineSeeder, Database, LedgerService, MemoryStore, ReceivablesStore,
    SettlementService,
};
use crate::workers::{ConsistencyWorker, RecomputeQueue};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReceivablesStore>,
    pub settlements: SettlementService,
    pub ledger: LedgerService,
    pub baselines: BaselineSeeder,
    pub queue: RecomputeQueue,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/settlements", post(settlements::submit_settlement))
        .route("/drivers/:driver_id/ledger", get(ledger::get_history))
        .route("/drivers/:driver_id/ledger/:date", get(ledger::get_snapshot))
        .route(
            "/drivers/:driver_id/ledger/:date/recompute",
            get(ledger::get_recompute_status),
        )
        .route(
            "/drivers/:driver_id/baselines",
            get(onboarding::list_driver_baselines),
        )
        .route("/onboarding/baselines", post(onboarding::seed_baselines))
        .route("/customers/aggregations", get(customers::get_aggregations))
        .route("/customers/receivables", get(customers::list_receivables))
        .route(
            "/inventory/receivables",
            get(inventory::get_inventory_receivables),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    worker: ConsistencyWorker,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Build the application against the configured store backend.
    pub async fn build(config: ReceivablesConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn ReceivablesStore> = match (config.store, config.database.as_ref()) {
            (StoreBackend::Postgres, Some(database)) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;

                Arc::new(db)
            }
            (StoreBackend::Postgres, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Postgres backend selected without database settings"
                )));
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        Self::build_with_store(config, store).await
    }

    /// Build the application on an already constructed store.
    pub async fn build_with_store(
        config: ReceivablesConfig,
        store: Arc<dyn ReceivablesStore>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let (worker, queue) = ConsistencyWorker::new(config.worker.clone(), store.clone());
        let shutdown_token = worker.shutdown_token();

        let state = AppState {
            settlements: SettlementService::new(
                store.clone(),
                queue.clone(),
                config.receivables.grace_days,
            ),
            ledger: LedgerService::new(store.clone()),
            baselines: BaselineSeeder::new(store.clone(), queue.clone()),
            queue,
            store,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Receivables service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            worker,
            shutdown_token,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cancelling this token stops the HTTP server and the consistency worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the HTTP server and the consistency worker until shutdown.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let worker_handle = self.worker.start();
        let app = router(self.state);
        let shutdown = self.shutdown_token.clone();

        tracing::info!(
            service = "receivables-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;

        self.shutdown_token.cancel();
        if let Err(e) = worker_handle.await {
            tracing::error!(error = %e, "Consistency worker task failed");
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
