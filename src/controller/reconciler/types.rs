//! # Types
//!
//! Core types for the reconciler.

use crate::config::{BrokerConfig, ControllerConfig};
use crate::controller::backend::{BackendError, BrokerBackend};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::cleaner::{CleanerError, EventTypeCleaner};
use crate::controller::reconciler::events::EventPublisher;
use crate::controller::sink::{SinkValidationError, SinkValidator};
use crate::controller::store::{StoreError, SubscriptionStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Cleaner(#[from] CleanerError),
    #[error(transparent)]
    SinkValidation(#[from] SinkValidationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcilerError {
    /// Optimistic-concurrency conflicts are requeued, not treated as failures
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_conflict())
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_secs, max_secs),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context for every reconciliation
#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn SubscriptionStore>,
    pub backend: Arc<dyn BrokerBackend>,
    pub cleaner: EventTypeCleaner,
    pub sink_validator: SinkValidator,
    pub events: Arc<dyn EventPublisher>,
    pub controller_config: ControllerConfig,
    /// Used when a Subscription does not set `maxInFlightMessages`
    pub default_max_in_flight: i64,
    // Per-resource retry state, keyed by namespace/name
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.backend.kind())
            .field("cleaner", &self.cleaner)
            .field("default_max_in_flight", &self.default_max_in_flight)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        backend: Arc<dyn BrokerBackend>,
        cleaner: EventTypeCleaner,
        sink_validator: SinkValidator,
        events: Arc<dyn EventPublisher>,
        controller_config: ControllerConfig,
        broker_config: &BrokerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            cleaner,
            sink_validator,
            events,
            controller_config,
            default_max_in_flight: broker_config.default_max_in_flight,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Drop the retry state of a resource that no longer exists
    pub fn forget_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(resource_key);
        }
    }

    /// Forget the retry state of a resource after it reconciled cleanly
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
