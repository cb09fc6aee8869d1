//! Prometheus metrics for lab-billing-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec, TextEncoder,
};

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "lab_billing_db_query_duration_seconds",
        "Database operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Record lifecycle events.
pub static RECORDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_records_total",
        "Total number of record events",
        &["event"] // created, deleted, state_changed
    )
    .expect("Failed to register records_total")
});

/// Invoice lifecycle events.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_invoices_total",
        "Total number of invoice events",
        &["event"] // created, updated, finalized, deleted
    )
    .expect("Failed to register invoices_total")
});

/// Payments by method.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_payments_total",
        "Total number of payments by payment method",
        &["payment_method"]
    )
    .expect("Failed to register payments_total")
});

/// Sum of applied payment amounts.
pub static PAYMENT_AMOUNT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lab_billing_payment_amount_total",
        "Total amount of applied payments"
    )
    .expect("Failed to register payment_amount_total")
});

/// Recalculations by trigger.
pub static RECALCULATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_recalculations_total",
        "Total number of invoice recalculations",
        &["trigger"] // manual, record_test_added, record_test_updated, record_test_removed
    )
    .expect("Failed to register recalculations_total")
});

/// Mutations refused by the finalization lock.
pub static LOCK_REJECTIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_lock_rejections_total",
        "Total number of mutations rejected because the invoice is finalized",
        &["entity"]
    )
    .expect("Failed to register lock_rejections_total")
});

/// Sequence number collisions that were retried.
pub static NUMBER_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "lab_billing_number_retries_total",
        "Total number of sequence number allocation retries",
        &["sequence"]
    )
    .expect("Failed to register number_retries_total")
});

/// Best-effort image cleanups that failed.
pub static IMAGE_CLEANUP_FAILURES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "lab_billing_image_cleanup_failures_total",
        "Total number of image cleanups that failed"
    )
    .expect("Failed to register image_cleanup_failures_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&RECORDS_TOTAL);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&PAYMENT_AMOUNT_TOTAL);
    Lazy::force(&RECALCULATIONS_TOTAL);
    Lazy::force(&LOCK_REJECTIONS_TOTAL);
    Lazy::force(&NUMBER_RETRIES_TOTAL);
    Lazy::force(&IMAGE_CLEANUP_FAILURES_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
