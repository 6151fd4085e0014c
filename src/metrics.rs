//! Prometheus metrics for the balance processor

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

lazy_static! {
    /// Inbound broker events by queue and outcome
    pub static ref EVENTS_RECEIVED_TOTAL: CounterVec = register_counter_vec!(
        "balance_processor_events_received_total",
        "Inbound broker events",
        &["queue", "status"]
    )
    .unwrap();

    /// Reconciliation pass duration by queue
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "balance_processor_reconciliation_duration_seconds",
        "Reconciliation pass duration in seconds",
        &["queue"]
    )
    .unwrap();

    /// Node IPC calls by method and outcome
    pub static ref NODE_CALLS_TOTAL: CounterVec = register_counter_vec!(
        "balance_processor_node_calls_total",
        "Node IPC calls",
        &["method", "status"]
    )
    .unwrap();

    /// Outbound balance-update events
    pub static ref BALANCE_UPDATES_PUBLISHED_TOTAL: CounterVec = register_counter_vec!(
        "balance_processor_balance_updates_published_total",
        "Outbound balance-update events",
        &["status"]
    )
    .unwrap();
}
