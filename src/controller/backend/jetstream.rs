//! # JetStream Backend
//!
//! Every (Subscription, subject) pair maps to one durable pull consumer on the
//! configured stream. The backend keeps a registry of the consumers it has
//! created or adopted, keyed by [`ConsumerKey`], and converges it on every
//! sync:
//!
//! 1. Create missing consumers, update those whose `maxAckPending` drifted.
//! 2. Delete tracked consumers whose subject is no longer desired.
//! 3. Delete consumers recorded in the previous status that are no longer
//!    desired. The registry starts empty after a restart; status does not.
//!
//! Each Subscription is synced under its own registry entry lock, so the diff
//! and the deletes are atomic with respect to other passes over the same
//! Subscription without blocking the rest.

use super::registry::ConsumerRegistry;
use super::{flag_on_close, BackendError, BrokerBackend, ConnectionClosedHandler, SyncRequest};
use crate::config::{BackendKind, BrokerConfig, DeliverPolicy, StreamSettings};
use crate::controller::backend::naming::ConsumerKey;
use crate::crd::{BackendType, Subscription};
use crate::observability::metrics;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Desired configuration of one durable consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub name: String,
    /// `namespace/name/subject`
    pub description: String,
    pub filter_subject: String,
    pub max_ack_pending: i64,
    pub deliver_policy: DeliverPolicy,
}

/// What the broker reports for an existing consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub filter_subject: String,
    pub max_ack_pending: i64,
}

#[async_trait]
pub trait JetStreamClient: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Create the stream or bring its settings in line
    async fn ensure_stream(&self, settings: &StreamSettings) -> Result<(), BackendError>;

    async fn consumer_names(&self) -> Result<Vec<String>, BackendError>;

    /// `Ok(None)` when no consumer with that name exists
    async fn consumer_info(&self, name: &str) -> Result<Option<ConsumerInfo>, BackendError>;

    async fn create_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError>;

    async fn update_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError>;

    /// `Ok(false)` when the consumer did not exist
    async fn delete_consumer(&self, name: &str) -> Result<bool, BackendError>;
}

#[async_trait]
pub trait JetStreamConnector: Send + Sync {
    /// `on_closed` must fire when the client gives up reconnecting
    async fn connect(
        &self,
        config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn JetStreamClient>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TrackedConsumer {
    name: String,
    max_ack_pending: i64,
}

#[derive(Default)]
struct Connection {
    client: Option<Arc<dyn JetStreamClient>>,
    on_closed: Option<ConnectionClosedHandler>,
}

/// [`BrokerBackend`] over JetStream durable consumers
pub struct JetStreamBackend {
    config: BrokerConfig,
    connector: Arc<dyn JetStreamConnector>,
    connection: Mutex<Connection>,
    closed: Arc<AtomicBool>,
    registry: ConsumerRegistry<TrackedConsumer>,
}

impl std::fmt::Debug for JetStreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamBackend")
            .field("url", &self.config.url)
            .field("stream", &self.config.stream.name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl JetStreamBackend {
    #[must_use]
    pub fn new(config: BrokerConfig, connector: Arc<dyn JetStreamConnector>) -> Self {
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

        client.ensure_stream(&self.config.stream).await?;
        info!(
            url = %self.config.url,
            stream = %self.config.stream.name,
            "Connected to JetStream"
        );

        connection.client = Some(client);
        connection.on_closed = Some(on_closed);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Live client, re-initializing first if the previous connection was closed
    async fn client(&self) -> Result<Arc<dyn JetStreamClient>, BackendError> {
        let mut connection = self.connection.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            let on_closed = connection
                .on_closed
                .clone()
                .ok_or(BackendError::NotInitialized)?;
            warn!("JetStream connection was closed, re-initializing");
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

    fn consumer_settings(&self, key: &ConsumerKey, max_ack_pending: i64) -> ConsumerSettings {
        ConsumerSettings {
            name: key.consumer_name(),
            description: key.identifier(),
            filter_subject: key.subject.clone(),
            max_ack_pending,
            deliver_policy: self.config.stream.deliver_policy,
        }
    }

    fn record(operation: &str) {
        metrics::record_broker_operation(BackendKind::JetStream.as_str(), operation);
    }

    fn record_error(operation: &str) {
        metrics::increment_broker_operation_errors(BackendKind::JetStream.as_str(), operation);
    }

    async fn create(
        client: &dyn JetStreamClient,
        settings: &ConsumerSettings,
    ) -> Result<(), BackendError> {
        client
            .create_consumer(settings)
            .await
            .inspect_err(|_| Self::record_error("create_consumer"))?;
        Self::record("create_consumer");
        info!(
            consumer = %settings.name,
            subject = %settings.filter_subject,
            max_ack_pending = settings.max_ack_pending,
            "Created JetStream consumer"
        );
        Ok(())
    }

    async fn update(
        client: &dyn JetStreamClient,
        settings: &ConsumerSettings,
    ) -> Result<(), BackendError> {
        client
            .update_consumer(settings)
            .await
            .inspect_err(|_| Self::record_error("update_consumer"))?;
        Self::record("update_consumer");
        info!(
            consumer = %settings.name,
            subject = %settings.filter_subject,
            max_ack_pending = settings.max_ack_pending,
            "Updated JetStream consumer"
        );
        Ok(())
    }

    async fn delete(client: &dyn JetStreamClient, name: &str) -> Result<(), BackendError> {
        let deleted = client
            .delete_consumer(name)
            .await
            .inspect_err(|_| Self::record_error("delete_consumer"))?;
        if deleted {
            Self::record("delete_consumer");
            info!(consumer = %name, "Deleted JetStream consumer");
        } else {
            debug!(consumer = %name, "JetStream consumer already absent");
        }
        Ok(())
    }

    /// Create, update or adopt the consumer for `key`
    async fn ensure_consumer(
        &self,
        client: &dyn JetStreamClient,
        consumers: &mut HashMap<ConsumerKey, TrackedConsumer>,
        key: &ConsumerKey,
        max_ack_pending: i64,
    ) -> Result<(), BackendError> {
        let tracked_pending = consumers.get(key).map(|t| t.max_ack_pending);
        if tracked_pending == Some(max_ack_pending) {
            return Ok(());
        }

        let settings = self.consumer_settings(key, max_ack_pending);
        if tracked_pending.is_some() {
            Self::update(client, &settings).await?;
        } else {
            match client.consumer_info(&settings.name).await? {
                Some(info) if info.max_ack_pending == max_ack_pending => {
                    debug!(consumer = %info.name, "Adopting existing JetStream consumer");
                }
                Some(_) => Self::update(client, &settings).await?,
                None => Self::create(client, &settings).await?,
            }
        }

        consumers.insert(
            key.clone(),
            TrackedConsumer {
                name: settings.name,
                max_ack_pending,
            },
        );
        Ok(())
    }

    /// Delete consumers on the stream that no Subscription owns
    ///
    /// `known` holds the consumer names the current Subscription specs map to.
    /// Consumers tracked in the registry are always kept.
    ///
    /// # Errors
    ///
    /// Returns the first [`BackendError`] from listing or deleting consumers.
    pub async fn delete_dangling_consumers(
        &self,
        known: &HashSet<String>,
    ) -> Result<usize, BackendError> {
        let client = self.client().await?;
        let mut tracked: HashSet<String> = HashSet::new();
        for entry in self.registry.entries().await {
            tracked.extend(entry.lock().await.values().map(|c| c.name.clone()));
        }

        let mut deleted = 0;
        for name in client.consumer_names().await? {
            if known.contains(&name) || tracked.contains(&name) {
                continue;
            }
            warn!(consumer = %name, "Deleting dangling JetStream consumer");
            Self::delete(client.as_ref(), &name).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Consumers the last written status says the Subscription owns
fn recorded_consumers(subscription: &Subscription) -> &[BackendType] {
    subscription
        .status
        .as_ref()
        .and_then(|s| s.backend.as_ref())
        .map(|b| b.types.as_slice())
        .unwrap_or_default()
}

#[async_trait]
impl BrokerBackend for JetStreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::JetStream
    }

    fn subject_prefix(&self) -> &str {
        &self.config.stream.subject_prefix
    }

    async fn initialize(&self, on_closed: ConnectionClosedHandler) -> Result<(), BackendError> {
        let mut connection = self.connection.lock().await;
        self.connect(&mut connection, on_closed).await
    }

    async fn sync_subscription(&self, request: SyncRequest<'_>) -> Result<(), BackendError> {
        let client = self.client().await?;
        let subscription = request.subscription;
        let max_ack_pending = request.max_in_flight.max(1);

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
        let before = consumers.len();

        for key in &desired {
            self.ensure_consumer(client.as_ref(), &mut consumers, key, max_ack_pending)
                .await?;
        }

        let stale: Vec<ConsumerKey> = consumers
            .keys()
            .filter(|k| !desired.contains(k))
            .cloned()
            .collect();

        let mut removed: HashSet<String> = HashSet::new();
        for key in stale {
            if let Some(tracked) = consumers.get(&key) {
                info!(subject = %key.subject, "Removing consumer for subject no longer desired");
                Self::delete(client.as_ref(), &tracked.name).await?;
                removed.insert(tracked.name.clone());
            }
            consumers.remove(&key);
        }

        let desired_names: HashSet<String> = desired.iter().map(ConsumerKey::consumer_name).collect();
        for recorded in recorded_consumers(subscription) {
            if desired_names.contains(&recorded.consumer_name)
                || !removed.insert(recorded.consumer_name.clone())
            {
                continue;
            }
            info!(
                subject = %recorded.subject,
                consumer = %recorded.consumer_name,
                "Removing consumer recorded in status for subject no longer desired"
            );
            Self::delete(client.as_ref(), &recorded.consumer_name).await?;
        }

        let active = self.registry.adjust_active(before, consumers.len());
        metrics::set_broker_consumers_active(BackendKind::JetStream.as_str(), active);
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &Subscription) -> Result<(), BackendError> {
        let client = self.client().await?;
        let namespace = subscription.namespace_or_default();
        let name = subscription.name_or_default();

        let mut deleted: BTreeSet<String> = BTreeSet::new();
        if let Some(entry) = self.registry.get(namespace, name).await {
            let mut consumers = entry.lock().await;
            let owned: Vec<(ConsumerKey, String)> = consumers
                .iter()
                .map(|(k, c)| (k.clone(), c.name.clone()))
                .collect();
            for (key, consumer) in owned {
                Self::delete(client.as_ref(), &consumer).await?;
                consumers.remove(&key);
                self.registry.adjust_active(1, 0);
                deleted.insert(consumer);
            }
        }

        // Consumers recorded in status survive a controller restart even though
        // the registry does not
        for backend_type in recorded_consumers(subscription) {
            if deleted.insert(backend_type.consumer_name.clone()) {
                Self::delete(client.as_ref(), &backend_type.consumer_name).await?;
            }
        }

        self.registry.remove(namespace, name).await;
        let active = self.registry.adjust_active(0, 0);
        metrics::set_broker_consumers_active(BackendKind::JetStream.as_str(), active);
        Ok(())
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
