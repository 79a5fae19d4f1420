//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.

use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError};
use crate::crd::Subscription;
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requeue a failed reconciliation with per-resource Fibonacci backoff
///
/// Backoff state is keyed by `namespace/name` so one failing Subscription
/// does not slow down the others.
pub fn handle_reconciliation_error(
    obj: Arc<Subscription>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = obj.name_or_default();
    let namespace = obj.namespace_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {}", namespace, name, error);
    observability::metrics::increment_reconciliation_errors();

    let config = &ctx.controller_config;
    let resource_key = format!("{namespace}/{name}");
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(resource_key).or_insert_with(|| {
                BackoffState::new(config.backoff_min_secs, config.backoff_max_secs)
            });
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!(
                "Failed to lock backoff_states: {}, using maximum backoff",
                e
            );
            (config.backoff_max_secs, 0)
        }
    };

    info!(
        "Retrying with Fibonacci backoff: {}s (error count: {})",
        backoff_seconds, error_count
    );

    observability::metrics::increment_requeues("error");
    Action::requeue(Duration::from_secs(backoff_seconds))
}
