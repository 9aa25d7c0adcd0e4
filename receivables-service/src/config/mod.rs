//! Configuration module for receivables-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReceivablesConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreBackend,
    pub database: Option<DatabaseConfig>,
    pub worker: WorkerConfig,
    pub receivables: ReceivablesPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORE_BACKEND '{}', expected postgres or memory",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Consistency worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_size: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
}

impl WorkerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            sweep_interval_secs: 30,
            sweep_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivablesPolicy {
    /// Days after the sale date a customer receivable falls due.
    pub grace_days: u32,
}

impl Default for ReceivablesPolicy {
    fn default() -> Self {
        Self {
            grace_days: crate::services::debt_tracker::DEFAULT_GRACE_DAYS,
        }
    }
}

/// Read `name`, falling back to `default` when unset. A value that is set but
/// does not parse is a configuration error.
fn env_or<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("Invalid {} '{}': {}", name, value, e))
        }),
        Err(_) => Ok(default),
    }
}

impl ReceivablesConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store = match env::var("STORE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StoreBackend::Postgres,
        };

        let database = match (store, env::var("DATABASE_URL")) {
            (_, Ok(url)) => Some(DatabaseConfig {
                url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            (StoreBackend::Postgres, Err(_)) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required"
                )));
            }
            (StoreBackend::Memory, Err(_)) => None,
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            queue_size: env_or("RECOMPUTE_QUEUE_SIZE", worker_defaults.queue_size)?,
            max_retries: env_or("RECOMPUTE_MAX_RETRIES", worker_defaults.max_retries)?,
            initial_backoff_ms: env_or(
                "RECOMPUTE_INITIAL_BACKOFF_MS",
                worker_defaults.initial_backoff_ms,
            )?,
            max_backoff_ms: env_or("RECOMPUTE_MAX_BACKOFF_MS", worker_defaults.max_backoff_ms)?,
            sweep_interval_secs: env_or(
                "RECOMPUTE_SWEEP_INTERVAL_SECS",
                worker_defaults.sweep_interval_secs,
            )?,
            sweep_batch_size: env_or(
                "RECOMPUTE_SWEEP_BATCH_SIZE",
                worker_defaults.sweep_batch_size,
            )?,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "receivables-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store,
            database,
            worker,
            receivables: ReceivablesPolicy {
                grace_days: env_or(
                    "RECEIVABLE_GRACE_DAYS",
                    ReceivablesPolicy::default().grace_days,
                )?,
            },
        })
    }

    /// In-memory configuration on an ephemeral port, for tests and local runs.
    pub fn in_memory() -> Self {
        Self {
            common: core_config::Config {
                port: 0,
                ..Default::default()
            },
            service_name: "receivables-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            store: StoreBackend::Memory,
            database: None,
            worker: WorkerConfig::default(),
            receivables: ReceivablesPolicy::default(),
        }
    }
}
