//! # Reconciliation Logic
//!
//! Converges one Subscription: finalizer, cleaned types, sink, broker
//! consumers, status. Errors go back to `error_policy()` which owns backoff.

use crate::controller::backend::SyncRequest;
use crate::controller::reconciler::events::{self, reasons};
use crate::controller::reconciler::finalizer::{add_finalizer, remove_finalizer};
use crate::controller::reconciler::status::{
    persist_not_active, persist_status, set_subscription_active, sync_initial_status,
};
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::Subscription;
use crate::observability::metrics;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Entry point handed to `Controller::run`
///
/// # Errors
///
/// Any error except a write conflict; conflicts are requeued here.
pub async fn reconcile(
    subscription: Arc<Subscription>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let start = Instant::now();
    let name = subscription.name_or_default().to_string();
    let namespace = subscription.namespace_or_default().to_string();

    let span = tracing::info_span!(
        "reconcile",
        resource.name = %name,
        resource.namespace = %namespace,
        resource.kind = "Subscription",
        backend = %ctx.backend.kind(),
    );

    metrics::increment_reconciliations();
    let result = reconcile_subscription(&ctx, &namespace, &name)
        .instrument(span)
        .await;
    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

    match result {
        Ok(action) => {
            ctx.reset_backoff(&format!("{namespace}/{name}"));
            Ok(action)
        }
        Err(e) if e.is_conflict() => {
            debug!(resource = %format!("{namespace}/{name}"), error = %e, "Write conflict, requeueing");
            metrics::increment_requeues("conflict");
            Ok(Action::requeue(
                ctx.controller_config.conflict_requeue_duration(),
            ))
        }
        Err(e) => Err(e),
    }
}

#[allow(
    clippy::too_many_lines,
    reason = "the steps read top to bottom in the order they run"
)]
async fn reconcile_subscription(
    ctx: &Reconciler,
    namespace: &str,
    name: &str,
) -> Result<Action, ReconcilerError> {
    // The cache may lag behind our own writes; always work on the stored object
    let Some(subscription) = ctx.store.get(namespace, name).await? else {
        debug!("Subscription no longer exists");
        return Ok(Action::await_change());
    };

    if subscription.is_being_deleted() {
        return handle_deletion(ctx, &subscription).await;
    }

    if !subscription.has_finalizer() {
        // The write triggers another reconcile which does the actual sync
        add_finalizer(ctx, &subscription).await?;
        return Ok(Action::await_change());
    }

    info!("Reconciling Subscription");

    let mut status = match sync_initial_status(ctx, &subscription).await {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "Event types could not be cleaned");
            events::warn_on(
                ctx.events.as_ref(),
                &subscription,
                reasons::VALIDATION_FAILED,
                e.to_string(),
            )
            .await;
            let current = subscription.status.clone().unwrap_or_default();
            persist_not_active(ctx, &subscription, current, &e.to_string()).await;
            return Err(e.into());
        }
    };

    if let Err(e) = ctx.sink_validator.validate(&subscription).await {
        warn!(sink = %subscription.spec.sink, reason = e.reason(), "Sink validation failed");
        events::warn_on(
            ctx.events.as_ref(),
            &subscription,
            reasons::VALIDATION_FAILED,
            e.to_string(),
        )
        .await;
        persist_not_active(ctx, &subscription, status, &e.to_string()).await;
        return Err(e.into());
    }

    let backend_types = status
        .backend
        .as_ref()
        .map(|b| b.types.clone())
        .unwrap_or_default();
    let request = SyncRequest {
        subscription: &subscription,
        types: &backend_types,
        max_in_flight: subscription.effective_max_in_flight(ctx.default_max_in_flight),
    };

    if let Err(e) = ctx.backend.sync_subscription(request).await {
        error!(error = %e, "Failed to sync Subscription with the broker");
        events::warn_on(
            ctx.events.as_ref(),
            &subscription,
            reasons::SYNC_FAILED,
            e.to_string(),
        )
        .await;
        persist_not_active(ctx, &subscription, status, &e.to_string()).await;
        return Err(e.into());
    }

    set_subscription_active(&mut status, true, "");
    if persist_status(ctx, &subscription, &status).await?.is_some() {
        info!(subjects = backend_types.len(), "Subscription is active");
        events::notify_on(
            ctx.events.as_ref(),
            &subscription,
            reasons::UPDATE,
            format!("Subscription is active with {} subject(s)", backend_types.len()),
        )
        .await;
    }

    Ok(Action::await_change())
}

async fn handle_deletion(
    ctx: &Reconciler,
    subscription: &Subscription,
) -> Result<Action, ReconcilerError> {
    if !subscription.has_finalizer() {
        debug!("Being deleted without our finalizer, nothing to do");
        return Ok(Action::await_change());
    }

    info!("Deleting broker consumers");
    if let Err(e) = ctx.backend.delete_subscription(subscription).await {
        error!(error = %e, "Failed to delete broker consumers");
        events::warn_on(
            ctx.events.as_ref(),
            subscription,
            reasons::SYNC_FAILED,
            e.to_string(),
        )
        .await;
        let current = subscription.status.clone().unwrap_or_default();
        persist_not_active(ctx, subscription, current, &e.to_string()).await;
        return Err(e.into());
    }

    remove_finalizer(ctx, subscription).await?;
    ctx.forget_backoff(&subscription.namespaced_name());
    Ok(Action::await_change())
}
