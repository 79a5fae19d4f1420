//! # Broker Backends
//!
//! The reconciler drives the broker through [`BrokerBackend`]. Two variants
//! exist, selected at startup by [`BackendKind`]:
//!
//! - `nats_core.rs` - plain NATS queue subscriptions, `maxInFlight` per subject
//! - `jetstream.rs` - durable JetStream pull consumers on one stream
//!
//! Both track what they created per Subscription in `registry.rs`.
//!
//! Both talk to the wire through the connector/client traits defined next to
//! them. `client.rs` implements those traits over `async-nats`.

pub mod client;
pub mod jetstream;
pub mod naming;
pub mod nats_core;
mod registry;

pub use client::{NatsConnector, NatsJetStreamConnector};
pub use nats_core::{CoreClient, CoreConnector, CoreSubscription, NatsCoreBackend};
pub use jetstream::{
    ConsumerInfo, ConsumerSettings, JetStreamBackend, JetStreamClient, JetStreamConnector,
};
pub use naming::{backend_types, compute_consumer_name, subject_for, ConsumerKey};

use crate::config::BackendKind;
use crate::crd::{BackendType, Subscription};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Invoked once when the broker connection is closed for good
pub type ConnectionClosedHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend is not initialized")]
    NotInitialized,
    #[error("not connected to the broker")]
    NotConnected,
    #[error("failed to connect to the broker at {url}: {message}")]
    Connect { url: String, message: String },
    #[error("broker {operation} failed: {message}")]
    Broker {
        operation: &'static str,
        message: String,
    },
}

impl BackendError {
    pub(crate) fn broker(operation: &'static str, err: impl std::fmt::Display) -> Self {
        BackendError::Broker {
            operation,
            message: err.to_string(),
        }
    }
}

/// What a backend needs to converge one Subscription
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    pub subscription: &'a Subscription,
    /// Unique subjects with their consumer names
    pub types: &'a [BackendType],
    pub max_in_flight: i64,
}

/// Owns the broker connection and every consumer created for Subscriptions
#[async_trait]
pub trait BrokerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Prefix placed in front of every subject this backend creates
    fn subject_prefix(&self) -> &str;

    /// Connect to the broker
    ///
    /// `on_closed` runs when reconnect attempts are exhausted. An error here
    /// is fatal for the process.
    async fn initialize(&self, on_closed: ConnectionClosedHandler) -> Result<(), BackendError>;

    /// Create or update the consumers in `request.types` and remove every other
    /// consumer tracked for the Subscription
    async fn sync_subscription(&self, request: SyncRequest<'_>) -> Result<(), BackendError>;

    /// Remove every consumer belonging to the Subscription. Absent consumers
    /// are not an error.
    async fn delete_subscription(&self, subscription: &Subscription) -> Result<(), BackendError>;

    /// Consumers currently tracked for `namespace/name`
    async fn tracked_subjects(&self, namespace: &str, name: &str) -> Vec<String>;
}

/// Wrap `on_closed` so `flag` is raised before the handler runs
pub(crate) fn flag_on_close(
    flag: &Arc<AtomicBool>,
    on_closed: ConnectionClosedHandler,
) -> ConnectionClosedHandler {
    let flag = Arc::clone(flag);
    Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
        on_closed()
    })
}
