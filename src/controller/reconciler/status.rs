//! # Status
//!
//! Computes the observed state written to `status` and persists it only when
//! it actually changed, so a steady-state reconcile produces no API write and
//! no watch event.

use crate::constants::{
    CONDITION_SUBSCRIPTION_ACTIVE, REASON_SUBSCRIPTION_ACTIVE, REASON_SUBSCRIPTION_NOT_ACTIVE,
};
use crate::controller::backend::backend_types;
use crate::controller::cleaner::{CleanerError, EventTypeCleaner};
use crate::controller::reconciler::events::{self, reasons};
use crate::controller::reconciler::types::Reconciler;
use crate::controller::store::StoreError;
use crate::crd::{
    BackendStatus, BackendType, Condition, EventType, Subscription, SubscriptionStatus,
};
use tracing::{debug, warn};

/// The `SubscriptionActive` condition for the given outcome
#[must_use]
pub fn subscription_active_condition(active: bool, message: &str) -> Condition {
    let (status, reason) = if active {
        ("True", REASON_SUBSCRIPTION_ACTIVE)
    } else {
        ("False", REASON_SUBSCRIPTION_NOT_ACTIVE)
    };
    Condition {
        r#type: CONDITION_SUBSCRIPTION_ACTIVE.to_string(),
        status: status.to_string(),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Replace the `SubscriptionActive` condition and mirror it into `ready`
///
/// The previous transition time is kept while the condition status stays the
/// same, so only real transitions move it.
pub fn set_subscription_active(status: &mut SubscriptionStatus, active: bool, message: &str) {
    let mut condition = subscription_active_condition(active, message);

    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.r#type == CONDITION_SUBSCRIPTION_ACTIVE)
    {
        if existing.status == condition.status {
            condition
                .last_transition_time
                .clone_from(&existing.last_transition_time);
        }
        *existing = condition;
    } else {
        status.conditions.push(condition);
    }

    status.ready = active;
}

/// Cleaned types and the backend subjects they map to under the current spec
///
/// # Errors
///
/// Returns the [`CleanerError`] for the first type that cannot be cleaned.
pub async fn desired_backend_types(
    cleaner: &EventTypeCleaner,
    subject_prefix: &str,
    subscription: &Subscription,
) -> Result<(Vec<EventType>, Vec<BackendType>), CleanerError> {
    let types = cleaner.clean_subscription_types(subscription).await?;
    let clean_source = cleaner.clean_source(&subscription.spec.source);
    let backend = backend_types(subscription, &types, subject_prefix, &clean_source);
    Ok((types, backend))
}

/// Status with cleaned types, effective config and backend view refreshed from spec
///
/// Conditions and `ready` are carried over from the current status.
///
/// # Errors
///
/// Returns the [`CleanerError`] for the first type that cannot be cleaned.
pub async fn sync_initial_status(
    ctx: &Reconciler,
    subscription: &Subscription,
) -> Result<SubscriptionStatus, CleanerError> {
    let mut status = subscription.status.clone().unwrap_or_default();

    let (types, backend) =
        desired_backend_types(&ctx.cleaner, ctx.backend.subject_prefix(), subscription).await?;

    status.types = types;
    status.config = Some(subscription.merged_config(ctx.default_max_in_flight));
    status.backend = Some(BackendStatus { types: backend });
    Ok(status)
}

/// Write `status` if it differs from what is stored
///
/// Returns the updated object, or `None` when nothing had to be written.
///
/// # Errors
///
/// Propagates [`StoreError`]; conflicts are left for the caller to requeue.
pub async fn persist_status(
    ctx: &Reconciler,
    subscription: &Subscription,
    status: &SubscriptionStatus,
) -> Result<Option<Subscription>, StoreError> {
    if subscription.status.as_ref() == Some(status) {
        debug!("Status unchanged, skipping update");
        return Ok(None);
    }

    match ctx.store.update_status(subscription, status).await {
        Ok(updated) => Ok(Some(updated)),
        Err(e) => {
            if !e.is_conflict() {
                events::warn_on(
                    ctx.events.as_ref(),
                    subscription,
                    reasons::UPDATE_FAILED,
                    format!("failed to update status: {e}"),
                )
                .await;
            }
            Err(e)
        }
    }
}

/// Record a failure in status without masking the failure itself
///
/// Write errors are logged; the caller returns the original error either way.
pub async fn persist_not_active(
    ctx: &Reconciler,
    subscription: &Subscription,
    mut status: SubscriptionStatus,
    message: &str,
) {
    set_subscription_active(&mut status, false, message);
    if let Err(e) = persist_status(ctx, subscription, &status).await {
        warn!(error = %e, "Failed to record not-active status");
    }
}
