//! Prometheus metrics for reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for store operation duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for reconciliation runs by outcome.
pub static RECONCILIATION_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_runs_total",
        "Total number of reconciliation runs",
        &["status"]
    )
    .expect("Failed to register RECONCILIATION_RUNS")
});

/// Counter for proposed matches persisted by runs.
pub static MATCHES_PROPOSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_matches_proposed_total",
        "Total number of proposed matches created",
        &["score_band"]
    )
    .expect("Failed to register MATCHES_PROPOSED")
});

/// Counter for confirmation attempts by outcome.
pub static CONFIRMATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_confirmations_total",
        "Total number of match confirmation attempts",
        &["outcome"]
    )
    .expect("Failed to register CONFIRMATIONS")
});

/// Counter for keyed requests by guard outcome.
pub static IDEMPOTENCY_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_idempotency_outcomes_total",
        "Total number of idempotency-keyed requests by outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to register IDEMPOTENCY_OUTCOMES")
});

/// Counter for explanation responses by effective source.
pub static EXPLANATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_explanations_total",
        "Total number of match explanations by source",
        &["source"]
    )
    .expect("Failed to register EXPLANATIONS")
});

/// Counter for bulk imports.
pub static IMPORTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_imports_total",
        "Total number of imported records",
        &["kind"]
    )
    .expect("Failed to register IMPORTS")
});

/// Counter for idempotency records removed by the cleanup sweep.
pub static IDEMPOTENCY_CLEANUP: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_idempotency_cleanup_total",
        "Idempotency records removed by the cleanup sweep",
        &["status"]
    )
    .expect("Failed to register IDEMPOTENCY_CLEANUP")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RECONCILIATION_RUNS);
    Lazy::force(&MATCHES_PROPOSED);
    Lazy::force(&CONFIRMATIONS);
    Lazy::force(&IDEMPOTENCY_OUTCOMES);
    Lazy::force(&EXPLANATIONS);
    Lazy::force(&IMPORTS);
    Lazy::force(&IDEMPOTENCY_CLEANUP);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_reconciliation_run(status: &str) {
    RECONCILIATION_RUNS.with_label_values(&[status]).inc();
}

pub fn record_match_proposed(score_band: &str) {
    MATCHES_PROPOSED.with_label_values(&[score_band]).inc();
}

pub fn record_confirmation(outcome: &str) {
    CONFIRMATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_idempotency_outcome(operation: &str, outcome: &str) {
    IDEMPOTENCY_OUTCOMES
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_explanation(source: &str) {
    EXPLANATIONS.with_label_values(&[source]).inc();
}

pub fn record_import(kind: &str, count: usize) {
    IMPORTS.with_label_values(&[kind]).inc_by(count as f64);
}

pub fn record_idempotency_cleanup(status: &str, removed: u64) {
    IDEMPOTENCY_CLEANUP
        .with_label_values(&[status])
        .inc_by(removed as f64);
}
