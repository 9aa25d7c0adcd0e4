//! Prometheus metrics for receivables-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, HistogramVec,
    IntGauge, TextEncoder,
};
use std::sync::OnceLock;

/// Recorder for the `metrics` facade used by the shared HTTP middleware.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Settlement counter by outcome.
pub static SETTLEMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_settlements_total",
        "Total number of settlements submitted",
        &["status"]  // ok, invalid, insufficient_inventory, error
    )
    .expect("Failed to register settlements_total")
});

/// Sale records written, by sale type.
pub static SALE_RECORDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_sale_records_total",
        "Total number of sale records written",
        &["sale_type"]
    )
    .expect("Failed to register sale_records_total")
});

/// Customer receivables opened, by type.
pub static CUSTOMER_RECEIVABLES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_customer_receivables_total",
        "Total number of customer receivables created",
        &["receivable_type"]
    )
    .expect("Failed to register customer_receivables_total")
});

/// Ledger recompute attempts by outcome.
pub static RECOMPUTES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_recomputes_total",
        "Total number of ledger recompute attempts",
        &["status"]  // updated, unchanged, conflict, retry, failed
    )
    .expect("Failed to register recomputes_total")
});

/// Recomputes that exhausted their retries. Alert on any increase.
pub static RECOMPUTE_ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_recompute_failures_total",
        "Ledger recomputes that failed after all retries",
        &["reason"]
    )
    .expect("Failed to register recompute_failures_total")
});

/// Keys currently queued or running in the consistency worker.
pub static RECOMPUTES_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "receivables_recomputes_in_flight",
        "Ledger recompute keys currently pending or running"
    )
    .expect("Failed to register recomputes_in_flight")
});

/// Recompute duration histogram.
pub static RECOMPUTE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "receivables_recompute_duration_seconds",
        "Ledger recompute duration in seconds",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register recompute_duration")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "receivables_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "receivables_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Install the HTTP metrics recorder and force lazy initialization of the
/// service metrics. Safe to call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already installed");
        }
        handle
    });

    Lazy::force(&SETTLEMENTS_TOTAL);
    Lazy::force(&SALE_RECORDS_TOTAL);
    Lazy::force(&CUSTOMER_RECEIVABLES_TOTAL);
    Lazy::force(&RECOMPUTES_TOTAL);
    Lazy::force(&RECOMPUTE_ALERTS_TOTAL);
    Lazy::force(&RECOMPUTES_IN_FLIGHT);
    Lazy::force(&RECOMPUTE_DURATION);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    output.push_str(&encoder.encode_to_string(&metric_families).unwrap_or_default());
    output
}
