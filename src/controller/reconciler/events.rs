//! # Kubernetes Events
//!
//! Operators read reconciliation outcomes from `kubectl describe subscription`.
//! Publishing is fire-and-forget: a failed event is logged and never fails a
//! reconciliation.

use crate::crd::Subscription;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] over `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// `controller_name` shows up as the reporting component
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Publish a Warning about `subscription`
pub async fn warn_on(
    publisher: &dyn EventPublisher,
    subscription: &Subscription,
    reason: &str,
    note: String,
) {
    publisher
        .publish(
            &subscription.object_ref(&()),
            EventType::Warning,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

/// Publish a Normal event about `subscription`
pub async fn notify_on(
    publisher: &dyn EventPublisher,
    subscription: &Subscription,
    reason: &str,
    note: String,
) {
    publisher
        .publish(
            &subscription.object_ref(&()),
            EventType::Normal,
            reason,
            actions::RECONCILE,
            Some(note),
        )
        .await;
}

/// Values of the REASON column
pub mod reasons {
    /// Event types could not be cleaned or the sink is invalid
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// The broker rejected a consumer create/update/delete
    pub const SYNC_FAILED: &str = "SyncFailed";
    /// A status or finalizer write failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    pub const UPDATE: &str = "Update";
}

/// Values of the ACTION column
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
}
