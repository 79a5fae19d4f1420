//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `eventing_reconciliations_total` - Total number of reconciliations
//! - `eventing_reconciliation_errors_total` - Total number of failed reconciliations
//! - `eventing_reconciliation_duration_seconds` - Duration of reconciliations
//! - `eventing_requeues_total{reason}` - Requeues by reason (conflict, error)
//! - `eventing_broker_operations_total{backend,operation}` - Broker mutations
//! - `eventing_broker_operation_errors_total{backend,operation}` - Failed broker calls
//! - `eventing_broker_consumers_active{backend}` - Consumers currently tracked
//! - `eventing_connection_closed_resyncs_total` - Resyncs triggered by a lost broker connection

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "eventing_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "eventing_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "eventing_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new("eventing_requeues_total", "Total number of requeues by reason"),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static BROKER_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "eventing_broker_operations_total",
            "Total number of broker mutations by backend and operation",
        ),
        &["backend", "operation"],
    )
    .expect("Failed to create BROKER_OPERATIONS_TOTAL metric - this should never happen")
});

static BROKER_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "eventing_broker_operation_errors_total",
            "Total number of failed broker operations by backend and operation",
        ),
        &["backend", "operation"],
    )
    .expect("Failed to create BROKER_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static BROKER_CONSUMERS_ACTIVE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "eventing_broker_consumers_active",
            "Current number of broker consumers tracked by the backend",
        ),
        &["backend"],
    )
    .expect("Failed to create BROKER_CONSUMERS_ACTIVE metric - this should never happen")
});

static CONNECTION_CLOSED_RESYNCS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "eventing_connection_closed_resyncs_total",
        "Total number of global resyncs triggered by a closed broker connection",
    )
    .expect("Failed to create CONNECTION_CLOSED_RESYNCS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Registration only fails when called twice"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_CONSUMERS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(CONNECTION_CLOSED_RESYNCS_TOTAL.clone()))?;

    Ok(())
}

/// Everything registered so far, for the `/metrics` endpoint
#[must_use]
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_broker_operation(backend: &str, operation: &str) {
    BROKER_OPERATIONS_TOTAL
        .with_label_values(&[backend, operation])
        .inc();
}

pub fn increment_broker_operation_errors(backend: &str, operation: &str) {
    BROKER_OPERATION_ERRORS_TOTAL
        .with_label_values(&[backend, operation])
        .inc();
}

pub fn set_broker_consumers_active(backend: &str, count: usize) {
    let count = i64::try_from(count).unwrap_or(i64::MAX);
    BROKER_CONSUMERS_ACTIVE
        .with_label_values(&[backend])
        .set(count);
}

pub fn increment_connection_closed_resyncs() {
    CONNECTION_CLOSED_RESYNCS_TOTAL.inc();
}
