//! # Finalizer
//!
//! The finalizer is added before any broker state exists and removed only after
//! the backend confirmed deletion.

use crate::constants::SUBSCRIPTION_FINALIZER;
use crate::controller::reconciler::events::{self, reasons};
use crate::controller::reconciler::types::Reconciler;
use crate::controller::store::StoreError;
use crate::crd::Subscription;
use tracing::info;

/// # Errors
///
/// Propagates the [`StoreError`] of the finalizer write.
pub async fn add_finalizer(
    ctx: &Reconciler,
    subscription: &Subscription,
) -> Result<Subscription, StoreError> {
    let mut finalizers = subscription.finalizers().to_vec();
    finalizers.push(SUBSCRIPTION_FINALIZER.to_string());
    let updated = write(ctx, subscription, finalizers).await?;
    info!("Added finalizer");
    Ok(updated)
}

/// # Errors
///
/// Propagates the [`StoreError`] of the finalizer write.
pub async fn remove_finalizer(
    ctx: &Reconciler,
    subscription: &Subscription,
) -> Result<Subscription, StoreError> {
    let finalizers: Vec<String> = subscription
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SUBSCRIPTION_FINALIZER)
        .cloned()
        .collect();
    let updated = write(ctx, subscription, finalizers).await?;
    info!("Removed finalizer");
    Ok(updated)
}

async fn write(
    ctx: &Reconciler,
    subscription: &Subscription,
    finalizers: Vec<String>,
) -> Result<Subscription, StoreError> {
    match ctx.store.update_finalizers(subscription, finalizers).await {
        Ok(updated) => Ok(updated),
        Err(e) => {
            if !e.is_conflict() {
                events::warn_on(
                    ctx.events.as_ref(),
                    subscription,
                    reasons::UPDATE_FAILED,
                    format!("failed to update finalizers: {e}"),
                )
                .await;
            }
            Err(e)
        }
    }
}
