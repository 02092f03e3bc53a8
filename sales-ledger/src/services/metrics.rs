//! Prometheus metrics for the sales ledger.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Invoice counter by lifecycle event (open, paid, cancelled, deleted).
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_invoices_total",
        "Total number of invoice lifecycle events by status",
        &["status"]
    )
    .expect("Failed to register invoices_total")
});

/// Payment counter by origin.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_payments_total",
        "Total number of payments recorded by origin",
        &["origin"]
    )
    .expect("Failed to register payments_total")
});

/// Payment reversal counter by outcome.
pub static REVERSALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_reversals_total",
        "Total number of payment reversals by outcome",
        &["outcome"] // reversed, payment_missing, invoice_missing
    )
    .expect("Failed to register reversals_total")
});

/// Store operation duration histogram.
pub static STORE_OP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_store_op_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register store_op_duration")
});

/// Aggregate refresh duration histogram.
pub static REFRESH_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_refresh_duration_seconds",
        "Account aggregate refresh duration in seconds",
        &["trigger"], // forced, passive
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register refresh_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&REVERSALS_TOTAL);
    Lazy::force(&STORE_OP_DURATION);
    Lazy::force(&REFRESH_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
