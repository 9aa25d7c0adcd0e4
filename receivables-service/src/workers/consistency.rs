use crate::config::WorkerConfig;
use crate::models::{LedgerKey, SnapshotUpsert};
use crate::services::error::ReceivablesError;
use crate::services::ledger::{LedgerService, RecomputeOutcome};
use crate::services::metrics::{
    RECOMPUTES_IN_FLIGHT, RECOMPUTES_TOTAL, RECOMPUTE_ALERTS_TOTAL, RECOMPUTE_DURATION,
};
use crate::services::store::ReceivablesStore;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long finished keys stay visible in the status table.
const DONE_RETENTION_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecomputeState {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeStatus {
    pub key: LedgerKey,
    pub state: RecomputeState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_utc: DateTime<Utc>,
}

type StatusTable = Arc<DashMap<LedgerKey, RecomputeStatus>>;

fn set_state(statuses: &StatusTable, key: LedgerKey, state: RecomputeState) {
    let mut entry = statuses.entry(key).or_insert_with(|| RecomputeStatus {
        key,
        state,
        attempts: 0,
        last_error: None,
        updated_utc: Utc::now(),
    });
    entry.state = state;
    entry.updated_utc = Utc::now();
}

/// Producer side of the consistency worker.
#[derive(Clone)]
pub struct RecomputeQueue {
    job_tx: mpsc::Sender<LedgerKey>,
    statuses: StatusTable,
}

impl RecomputeQueue {
    /// Ask for `key` to be recomputed. Never blocks; a key that cannot be
    /// queued is left to the outbox sweep.
    pub fn submit(&self, key: LedgerKey) -> bool {
        match self.job_tx.try_send(key) {
            Ok(()) => {
                if !matches!(
                    self.statuses.get(&key).map(|s| s.state),
                    Some(RecomputeState::Running)
                ) {
                    set_state(&self.statuses, key, RecomputeState::Pending);
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(key = %key, "Recompute queue full, deferring to sweep");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(key = %key, "Consistency worker stopped, key stays in outbox");
                false
            }
        }
    }

    pub fn status(&self, key: LedgerKey) -> Option<RecomputeStatus> {
        self.statuses.get(&key).map(|s| s.clone())
    }
}

/// Recomputes ledger snapshots after settlements commit.
///
/// A single dispatcher owns the per-key slots: at most one task runs per key,
/// and submissions for a running key collapse into one re-run started when
/// it finishes. Different keys run in parallel.
pub struct ConsistencyWorker {
    config: WorkerConfig,
    ledger: LedgerService,
    store: Arc<dyn ReceivablesStore>,
    queue: RecomputeQueue,
    job_rx: Option<mpsc::Receiver<LedgerKey>>,
    shutdown_token: CancellationToken,
}

impl ConsistencyWorker {
    pub fn new(config: WorkerConfig, store: Arc<dyn ReceivablesStore>) -> (Self, RecomputeQueue) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));
        let queue = RecomputeQueue {
            job_tx,
            statuses: Arc::new(DashMap::new()),
        };

        let worker = Self {
            config,
            ledger: LedgerService::new(store.clone()),
            store,
            queue: queue.clone(),
            job_rx: Some(job_rx),
            shutdown_token: CancellationToken::new(),
        };

        (worker, queue)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the dispatcher. The first sweep runs immediately and replays
    /// whatever the outbox held at startup.
    pub fn start(mut self) -> JoinHandle<()> {
        let mut job_rx = match self.job_rx.take() {
            Some(rx) => rx,
            None => return tokio::spawn(async {}),
        };

        tracing::info!(
            max_retries = self.config.max_retries,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Starting consistency worker"
        );

        let runner = Arc::new(KeyRunner {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown_token.clone(),
        });
        let shutdown = self.shutdown_token.clone();
        let config = self.config;
        let store = self.store;
        let statuses = self.queue.statuses.clone();

        tokio::spawn(async move {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<LedgerKey>();
            // Present = running; value = a re-run was requested meanwhile.
            let mut running: HashMap<LedgerKey, bool> = HashMap::new();
            let mut sweep = tokio::time::interval(config.sweep_interval());

            let dispatch = |key: LedgerKey, running: &mut HashMap<LedgerKey, bool>| {
                if let Some(rerun) = running.get_mut(&key) {
                    *rerun = true;
                    return;
                }
                running.insert(key, false);
                let runner = runner.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    runner.run(key).await;
                    let _ = done_tx.send(key);
                });
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(running = running.len(), "Consistency worker shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        match job {
                            Some(key) => dispatch(key, &mut running),
                            None => {
                                tracing::info!("Recompute channel closed, dispatcher exiting");
                                break;
                            }
                        }
                    }
                    Some(key) = done_rx.recv() => {
                        if running.remove(&key) == Some(true) {
                            set_state(&statuses, key, RecomputeState::Pending);
                            dispatch(key, &mut running);
                        }
                    }
                    _ = sweep.tick() => {
                        match store.pending_recomputes(config.sweep_batch_size).await {
                            Ok(keys) => {
                                let mut replayed = 0;
                                for key in keys {
                                    if !running.contains_key(&key) {
                                        set_state(&statuses, key, RecomputeState::Pending);
                                        dispatch(key, &mut running);
                                        replayed += 1;
                                    }
                                }
                                if replayed > 0 {
                                    tracing::info!(replayed, "Replayed pending recomputes from outbox");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to read recompute outbox");
                            }
                        }
                        let cutoff = Utc::now() - chrono::Duration::seconds(DONE_RETENTION_SECS);
                        statuses.retain(|_, s| {
                            s.state != RecomputeState::Done || s.updated_utc > cutoff
                        });
                    }
                }
                RECOMPUTES_IN_FLIGHT.set(running.len() as i64);
            }
        })
    }
}

struct KeyRunner {
    ledger: LedgerService,
    store: Arc<dyn ReceivablesStore>,
    queue: RecomputeQueue,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl KeyRunner {
    async fn run(&self, key: LedgerKey) {
        let start = Instant::now();
        set_state(&self.queue.statuses, key, RecomputeState::Running);

        // Taken before any data is read. Anything enqueued later carries a
        // new ticket and keeps its outbox row.
        let ticket = match self.store.claim_recompute(key).await {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to claim outbox row, leaving it for the sweep");
                None
            }
        };

        let backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff(),
            max_interval: self.config.max_backoff(),
            max_elapsed_time: None,
            ..Default::default()
        };
        let max_attempts = self.config.max_retries.saturating_add(1);
        let attempts = AtomicU32::new(0);

        let attempt = || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(mut status) = self.queue.statuses.get_mut(&key) {
                status.attempts = n;
            }
            match self.ledger.recompute(key).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if e.is_transient() && n < max_attempts => {
                    let label = if matches!(e, ReceivablesError::VersionConflict(_)) {
                        "conflict"
                    } else {
                        "retry"
                    };
                    RECOMPUTES_TOTAL.with_label_values(&[label]).inc();
                    tracing::warn!(key = %key, attempt = n, error = %e, "Recompute failed, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };

        let result = tokio::select! {
            r = retry(backoff, attempt) => r,
            _ = self.shutdown.cancelled() => {
                tracing::info!(key = %key, "Recompute interrupted by shutdown, left in outbox");
                return;
            }
        };

        match result {
            Ok(outcome) => {
                // The store already persisted the cascade with the write.
                if let RecomputeOutcome::Updated(SnapshotUpsert {
                    cascaded: Some(next),
                    ..
                }) = &outcome
                {
                    self.queue.submit(*next);
                }
                if let Some(ticket) = ticket {
                    if let Err(e) = self.store.clear_recompute(key, ticket).await {
                        tracing::warn!(key = %key, error = %e, "Failed to clear recompute outbox row");
                    }
                }

                let status = match outcome {
                    RecomputeOutcome::Updated(_) => "updated",
                    RecomputeOutcome::Unchanged(_) => "unchanged",
                };
                RECOMPUTES_TOTAL.with_label_values(&[status]).inc();
                RECOMPUTE_DURATION
                    .with_label_values(&[status])
                    .observe(start.elapsed().as_secs_f64());
                if let Some(mut s) = self.queue.statuses.get_mut(&key) {
                    s.last_error = None;
                }
                set_state(&self.queue.statuses, key, RecomputeState::Done);

                tracing::info!(
                    key = %key,
                    outcome = status,
                    duration_ms = start.elapsed().as_millis(),
                    "Recompute finished"
                );
            }
            Err(e) => {
                let failure = ReceivablesError::ConsistencyRecomputeFailure {
                    key,
                    message: e.to_string(),
                };
                let reason = if e.is_transient() {
                    "retries_exhausted"
                } else {
                    "permanent"
                };

                RECOMPUTES_TOTAL.with_label_values(&["failed"]).inc();
                RECOMPUTE_ALERTS_TOTAL.with_label_values(&[reason]).inc();
                RECOMPUTE_DURATION
                    .with_label_values(&["failed"])
                    .observe(start.elapsed().as_secs_f64());
                if let Some(mut s) = self.queue.statuses.get_mut(&key) {
                    s.last_error = Some(e.to_string());
                }
                set_state(&self.queue.statuses, key, RecomputeState::Failed);

                tracing::error!(
                    key = %key,
                    attempts = attempts.load(Ordering::SeqCst),
                    error = %failure,
                    "Recompute failed after retries"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentType, SaleRecord, SaleType};
    use crate::services::memory::MemoryStore;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_config(max_retries: u32) -> WorkerConfig {
        WorkerConfig {
            queue_size: 16,
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            sweep_interval_secs: 3600,
            sweep_batch_size: 100,
        }
    }

    fn sale(key: LedgerKey, net: i64, cash: i64) -> SaleRecord {
        SaleRecord {
            sale_id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            settlement_id: Uuid::new_v4(),
            driver_id: key.driver_id,
            customer_label: "Depot".to_string(),
            product_id: Uuid::new_v4(),
            cylinder_size: "6KG".parse().unwrap(),
            sale_type: SaleType::Package,
            payment_type: PaymentType::Credit,
            sale_date: key.date,
            quantity: 1,
            unit_price: Decimal::from(net),
            gross_value: Decimal::from(net),
            discount: Decimal::ZERO,
            net_value: Decimal::from(net),
            cash_deposited: Decimal::from(cash),
            cylinders_deposited: 0,
            created_utc: Utc::now(),
        }
    }

    async fn commit_sale(store: &MemoryStore, record: SaleRecord) -> LedgerKey {
        let key = LedgerKey::new(record.tenant_id, record.driver_id, record.sale_date);
        let mut tx = store.begin_settlement().await.unwrap();
        tx.insert_sale_records(&[record]).await.unwrap();
        tx.enqueue_recompute(key).await.unwrap();
        tx.commit().await.unwrap();
        key
    }

    async fn wait_for(queue: &RecomputeQueue, key: LedgerKey, state: RecomputeState) {
        for _ in 0..200 {
            if queue.status(key).map(|s| s.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}: {:?}", key, state, queue.status(key));
    }

    fn key_on(day: u32) -> (Uuid, Uuid, NaiveDate) {
        (
            Uuid::from_u128(10),
            Uuid::from_u128(20),
            NaiveDate::from_ymd_opt(2024, 7, day).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_submitted_key_is_recomputed_and_cleared() {
        let store = MemoryStore::new();
        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        let (t, d, date) = key_on(1);
        let key = commit_sale(&store, sale(LedgerKey::new(t, d, date), 800, 300)).await;
        assert!(queue.submit(key));

        wait_for(&queue, key, RecomputeState::Done).await;
        let snapshot = store.get_snapshot(key).await.unwrap().unwrap();
        assert_eq!(snapshot.total_cash_receivables, Decimal::from(500));
        assert!(store.pending_recomputes(10).await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_startup_replays_outbox() {
        let store = MemoryStore::new();
        let (t, d, date) = key_on(2);
        let key = commit_sale(&store, sale(LedgerKey::new(t, d, date), 100, 0)).await;

        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        wait_for(&queue, key, RecomputeState::Done).await;
        assert!(store.get_snapshot(key).await.unwrap().is_some());
        token.cancel();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = MemoryStore::new();
        store.fail_next_snapshot_writes(2);
        let (t, d, date) = key_on(3);
        let key = commit_sale(&store, sale(LedgerKey::new(t, d, date), 100, 0)).await;

        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        wait_for(&queue, key, RecomputeState::Done).await;
        assert_eq!(queue.status(key).unwrap().attempts, 3);
        token.cancel();
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_key_failed_in_outbox() {
        let store = MemoryStore::new();
        store.fail_next_snapshot_writes(10);
        let (t, d, date) = key_on(4);
        let key = commit_sale(&store, sale(LedgerKey::new(t, d, date), 100, 0)).await;

        let (worker, queue) = ConsistencyWorker::new(test_config(1), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        wait_for(&queue, key, RecomputeState::Failed).await;
        let status = queue.status(key).unwrap();
        assert_eq!(status.attempts, 2);
        assert!(status.last_error.is_some());
        assert_eq!(store.pending_recomputes(10).await.unwrap(), vec![key]);
        assert!(store.get_snapshot(key).await.unwrap().is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn test_back_dated_change_rolls_forward() {
        let store = MemoryStore::new();
        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        let (t, d, _) = key_on(1);
        let later = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(10).2), 200, 0)).await;
        queue.submit(later);
        wait_for(&queue, later, RecomputeState::Done).await;

        let earlier = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(5).2), 300, 0)).await;
        queue.submit(earlier);
        wait_for(&queue, earlier, RecomputeState::Done).await;

        for _ in 0..200 {
            let row = store.get_snapshot(later).await.unwrap().unwrap();
            if row.total_cash_receivables == Decimal::from(500) {
                assert_eq!(row.cash_receivables_change, Decimal::from(200));
                token.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("later snapshot was not rolled forward");
    }

    #[tokio::test]
    async fn test_submissions_while_running_merge_into_one_rerun() {
        let store = MemoryStore::new();
        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        let (t, d, date) = key_on(6);
        let key = LedgerKey::new(t, d, date);
        let gate = store.hold_snapshot_writes().await;

        commit_sale(&store, sale(key, 100, 0)).await;
        queue.submit(key);
        for _ in 0..200 {
            if store.snapshot_writes_in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.snapshot_writes_in_flight(), 1);
        assert_eq!(queue.status(key).unwrap().state, RecomputeState::Running);

        // Two more sales land while the first run is stuck on its write.
        for net in [200, 300] {
            commit_sale(&store, sale(key, net, 0)).await;
            assert!(queue.submit(key));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.snapshot_writes_in_flight(), 1);
        assert_eq!(queue.status(key).unwrap().state, RecomputeState::Running);

        drop(gate);

        for _ in 0..200 {
            let row = store.get_snapshot(key).await.unwrap();
            if row.as_ref().map(|r| r.total_cash_receivables) == Some(Decimal::from(600)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wait_for(&queue, key, RecomputeState::Done).await;

        // The first run wrote version 1 without the late sales; a single
        // merged re-run wrote version 2 with all of them.
        let row = store.get_snapshot(key).await.unwrap().unwrap();
        assert_eq!(row.total_cash_receivables, Decimal::from(600));
        assert_eq!(row.version, 2);
        assert_eq!(store.peak_snapshot_writes_in_flight(), 1);
        assert!(store.pending_recomputes(10).await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_version_conflict_is_retried_from_fresh_state() {
        let store = MemoryStore::new();
        let (t, d, _) = key_on(1);
        let day1 = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(7).2), 400, 100)).await;
        let day2 = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(8).2), 200, 0)).await;

        LedgerService::new(Arc::new(store.clone()))
            .recompute(day1)
            .await
            .unwrap();
        let ticket = store.claim_recompute(day1).await.unwrap().unwrap();
        store.clear_recompute(day1, ticket).await.unwrap();

        // A stale day-2 row appears between the worker's read and its write.
        store
            .race_next_snapshot_write(crate::models::SnapshotWrite {
                key: day2,
                cash_receivables_change: Decimal::from(7),
                cylinder_receivables_change: 0,
                total_cash_receivables: Decimal::from(7),
                total_cylinder_receivables: 0,
                expected_version: None,
            })
            .await;

        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        wait_for(&queue, day2, RecomputeState::Done).await;
        assert_eq!(queue.status(day2).unwrap().attempts, 2);

        let row = store.get_snapshot(day2).await.unwrap().unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.cash_receivables_change, Decimal::from(200));
        assert_eq!(row.total_cash_receivables, Decimal::from(500));
        assert!(store.pending_recomputes(10).await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_cascade_survives_a_crash_after_the_write() {
        let store = MemoryStore::new();
        let (t, d, _) = key_on(1);
        let ledger = LedgerService::new(Arc::new(store.clone()));

        let later = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(20).2), 100, 0)).await;
        ledger.recompute(later).await.unwrap();
        let ticket = store.claim_recompute(later).await.unwrap().unwrap();
        store.clear_recompute(later, ticket).await.unwrap();

        // A back-dated sale is written, then the process dies before the
        // worker gets any further.
        let earlier = commit_sale(&store, sale(LedgerKey::new(t, d, key_on(15).2), 50, 0)).await;
        ledger.recompute(earlier).await.unwrap();
        assert_eq!(store.pending_recomputes(10).await.unwrap(), vec![earlier, later]);

        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        worker.start();

        wait_for(&queue, later, RecomputeState::Done).await;
        wait_for(&queue, earlier, RecomputeState::Done).await;
        let row = store.get_snapshot(later).await.unwrap().unwrap();
        assert_eq!(row.total_cash_receivables, Decimal::from(150));
        assert!(store.pending_recomputes(10).await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let store = MemoryStore::new();
        let (worker, queue) = ConsistencyWorker::new(test_config(3), Arc::new(store.clone()));
        let token = worker.shutdown_token();
        let handle = worker.start();
        token.cancel();
        handle.await.unwrap();

        let (t, d, date) = key_on(9);
        assert!(!queue.submit(LedgerKey::new(t, d, date)));
    }
}
