//! # NATS Core Backend
//!
//! Plain NATS has no server-side consumers. Delivery parallelism is expressed
//! by holding `maxInFlight` queue subscriptions per subject, all in the queue
//! group `namespace/name/subject`, so the server spreads messages across them.
//!
//! Subscriptions die with the connection. When the connection is closed and
//! re-initialized the registry starts empty and the global resync recreates
//! everything.

use super::registry::ConsumerRegistry;
use super::{flag_on_close, BackendError, BrokerBackend, ConnectionClosedHandler, SyncRequest};
use crate::config::{BackendKind, BrokerConfig};
use crate::controller::backend::naming::ConsumerKey;
use crate::crd::Subscription;
use crate::observability::metrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One live queue subscription
#[async_trait]
pub trait CoreSubscription: Send {
    async fn unsubscribe(self: Box<Self>) -> Result<(), BackendError>;
}

#[async_trait]
pub trait CoreClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn CoreSubscription>, BackendError>;
}

#[async_trait]
pub trait CoreConnector: Send + Sync {
    /// `on_closed` must fire when the client gives up reconnecting
    async fn connect(
        &self,
        config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn CoreClient>, BackendError>;
}

#[derive(Default)]
struct Connection {
    client: Option<Arc<dyn CoreClient>>,
    on_closed: Option<ConnectionClosedHandler>,
}

/// [`BrokerBackend`] over plain NATS queue subscriptions
pub struct NatsCoreBackend {
    config: BrokerConfig,
    connector: Arc<dyn CoreConnector>,
    connection: Mutex<Connection>,
    closed: Arc<AtomicBool>,
    registry: ConsumerRegistry<Vec<Box<dyn CoreSubscription>>>,
}

impl std::fmt::Debug for NatsCoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsCoreBackend")
            .field("url", &self.config.url)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl NatsCoreBackend {
    #[must_use]
    pub fn new(config: BrokerConfig, connector: Arc<dyn CoreConnector>) -> Self {
        Self {
            config,
            connector,
            connection: Mutex::new(Connection::default()),
            closed: Arc::new(AtomicBool::new(false)),
            registry: ConsumerRegistry::default(),
        }
    }

    async fn connect(
        &self,
        connection: &mut Connection,
        on_closed: ConnectionClosedHandler,
    ) -> Result<(), BackendError> {
        let client = self
            .connector
            .connect(
                &self.config,
                flag_on_close(&self.closed, Arc::clone(&on_closed)),
            )
            .await?;

        connection.client = Some(client);
        connection.on_closed = Some(on_closed);
        self.closed.store(false, Ordering::SeqCst);

        let dropped = self.registry.clear().await;
        if dropped > 0 {
            debug!(
                count = dropped,
                "Discarding subscriptions from previous connection"
            );
        }
        metrics::set_broker_consumers_active(BackendKind::NatsCore.as_str(), 0);

        info!(url = %self.config.url, "Connected to NATS");
        Ok(())
    }

    /// Live client, re-initializing first if the previous connection was closed
    async fn client(&self) -> Result<Arc<dyn CoreClient>, BackendError> {
        let mut connection = self.connection.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            let on_closed = connection
                .on_closed
                .clone()
                .ok_or(BackendError::NotInitialized)?;
            warn!("NATS connection was closed, re-initializing");
            self.connect(&mut connection, on_closed).await?;
        }

        let client = connection
            .client
            .clone()
            .ok_or(BackendError::NotInitialized)?;
        if client.is_connected() {
            Ok(client)
        } else {
            Err(BackendError::NotConnected)
        }
    }

    fn record(operation: &str) {
        metrics::record_broker_operation(BackendKind::NatsCore.as_str(), operation);
    }

    fn record_error(operation: &str) {
        metrics::increment_broker_operation_errors(BackendKind::NatsCore.as_str(), operation);
    }

    async fn unsubscribe_all(
        key: &ConsumerKey,
        subscriptions: Vec<Box<dyn CoreSubscription>>,
    ) -> Result<(), BackendError> {
        let mut first_error = None;
        for subscription in subscriptions {
            match subscription.unsubscribe().await {
                Ok(()) => Self::record("unsubscribe"),
                Err(e) => {
                    Self::record_error("unsubscribe");
                    warn!(subject = %key.subject, error = %e, "Failed to unsubscribe");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl BrokerBackend for NatsCoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NatsCore
    }

    fn subject_prefix(&self) -> &str {
        ""
    }

    async fn initialize(&self, on_closed: ConnectionClosedHandler) -> Result<(), BackendError> {
        let mut connection = self.connection.lock().await;
        self.connect(&mut connection, on_closed).await
    }

    async fn sync_subscription(&self, request: SyncRequest<'_>) -> Result<(), BackendError> {
        let client = self.client().await?;
        let subscription = request.subscription;
        let target = usize::try_from(request.max_in_flight.max(1)).unwrap_or(1);

        let desired: Vec<ConsumerKey> = request
            .types
            .iter()
            .map(|t| ConsumerKey::new(subscription, &t.subject))
            .collect();

        let entry = self
            .registry
            .entry(
                subscription.namespace_or_default(),
                subscription.name_or_default(),
            )
            .await;
        let mut consumers = entry.lock().await;

        for key in &desired {
            let subscriptions = consumers.entry(key.clone()).or_default();

            while subscriptions.len() < target {
                let queue_group = key.identifier();
                let created = client
                    .queue_subscribe(&key.subject, &queue_group)
                    .await
                    .inspect_err(|_| Self::record_error("subscribe"))?;
                Self::record("subscribe");
                subscriptions.push(created);
                self.registry.adjust_active(0, 1);
            }

            if subscriptions.len() > target {
                let surplus = subscriptions.split_off(target);
                debug!(
                    subject = %key.subject,
                    count = surplus.len(),
                    "Removing surplus queue subscriptions"
                );
                self.registry.adjust_active(surplus.len(), 0);
                Self::unsubscribe_all(key, surplus).await?;
            }
        }

        let stale: Vec<ConsumerKey> = consumers
            .keys()
            .filter(|k| !desired.contains(k))
            .cloned()
            .collect();

        for key in stale {
            if let Some(subscriptions) = consumers.remove(&key) {
                info!(subject = %key.subject, "Removing subscriptions for subject no longer desired");
                self.registry.adjust_active(subscriptions.len(), 0);
                Self::unsubscribe_all(&key, subscriptions).await?;
            }
        }

        let active = self.registry.adjust_active(0, 0);
        metrics::set_broker_consumers_active(BackendKind::NatsCore.as_str(), active);
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &Subscription) -> Result<(), BackendError> {
        self.client().await?;
        let namespace = subscription.namespace_or_default();
        let name = subscription.name_or_default();

        let mut first_error = None;
        if let Some(entry) = self.registry.get(namespace, name).await {
            let mut consumers = entry.lock().await;
            for (key, subscriptions) in consumers.drain() {
                self.registry.adjust_active(subscriptions.len(), 0);
                if let Err(e) = Self::unsubscribe_all(&key, subscriptions).await {
                    first_error.get_or_insert(e);
                }
            }
        }
        self.registry.remove(namespace, name).await;

        let active = self.registry.adjust_active(0, 0);
        metrics::set_broker_consumers_active(BackendKind::NatsCore.as_str(), active);
        first_error.map_or(Ok(()), Err)
    }

    async fn tracked_subjects(&self, namespace: &str, name: &str) -> Vec<String> {
        let Some(entry) = self.registry.get(namespace, name).await else {
            return Vec::new();
        };
        let mut subjects: Vec<String> = entry
            .lock()
            .await
            .keys()
            .map(|k| k.subject.clone())
            .collect();
        subjects.sort();
        subjects
    }
}
