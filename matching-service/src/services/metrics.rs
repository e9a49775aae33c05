//! Prometheus metrics for matching-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

/// Histogram for store operation duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_db_query_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for lifecycle operations by outcome.
pub static MATCH_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_operations_total",
        "Total number of match lifecycle operations",
        &["operation", "status"]
    )
    .expect("Failed to register MATCH_OPERATIONS")
});

/// Counter for proposals by target kind.
pub static PROPOSALS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_proposals_total",
        "Total number of match proposals created",
        &["target"]
    )
    .expect("Failed to register PROPOSALS")
});

/// Histogram for auto-match sweep duration.
pub static AUTO_MATCH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "matching_auto_match_duration_seconds",
        "Auto-match sweep duration in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register AUTO_MATCH_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&MATCH_OPERATIONS);
    Lazy::force(&PROPOSALS);
    Lazy::force(&AUTO_MATCH_DURATION);
    Lazy::force(&ERRORS);
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

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record a lifecycle operation.
pub fn record_match_operation(operation: &str, status: &str) {
    MATCH_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a created proposal.
pub fn record_proposal(target: &str) {
    PROPOSALS.with_label_values(&[target]).inc();
}

/// Record an auto-match sweep duration.
pub fn record_auto_match_duration(duration_secs: f64) {
    AUTO_MATCH_DURATION.observe(duration_secs);
}
