//! Common test utilities
//!
//! In-memory fakes for the Kubernetes store, the broker clients and the event
//! recorder, plus builders for Subscriptions and reconcilers.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use futures::FutureExt;
use eventing_controller::config::{BackendKind, BrokerConfig, ControllerConfig, StreamSettings};
use eventing_controller::controller::backend::{
    BackendError, BrokerBackend, ConnectionClosedHandler, ConsumerInfo, ConsumerSettings,
    CoreClient, CoreConnector, CoreSubscription, JetStreamBackend, JetStreamClient,
    JetStreamConnector, NatsCoreBackend,
};
use eventing_controller::controller::cleaner::EventTypeCleaner;
use eventing_controller::controller::reconciler::{EventPublisher, Reconciler};
use eventing_controller::controller::sink::SinkValidator;
use eventing_controller::controller::store::{
    ApplicationLookup, ServiceLookup, StoreError, SubscriptionStore,
};
use eventing_controller::crd::{Application, ApplicationSpec, Subscription, SubscriptionStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

pub const EVENT_TYPE_PREFIX: &str = "sap.kyma.custom";
pub const NAMESPACE: &str = "test";
pub const SINK: &str = "http://sink.test.svc.cluster.local:8080";

static RUSTLS_INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Subscription in [`NAMESPACE`] with the given legacy types
pub fn subscription(name: &str, types: &[&str]) -> Subscription {
    subscription_with(name, types, SINK, None)
}

pub fn subscription_with(
    name: &str,
    types: &[&str],
    sink: &str,
    max_in_flight: Option<i64>,
) -> Subscription {
    subscription_from_source(name, "commerce", types, sink, max_in_flight)
}

pub fn subscription_from_source(
    name: &str,
    source: &str,
    types: &[&str],
    sink: &str,
    max_in_flight: Option<i64>,
) -> Subscription {
    let mut spec = serde_json::json!({
        "source": source,
        "types": types,
        "sink": sink,
    });
    if let Some(max) = max_in_flight {
        spec["config"] = serde_json::json!({ "maxInFlightMessages": max });
    }
    serde_json::from_value(serde_json::json!({
        "apiVersion": "eventing.kyma-project.io/v1alpha2",
        "kind": "Subscription",
        "metadata": { "name": name, "namespace": NAMESPACE, "uid": format!("uid-{name}") },
        "spec": spec,
    }))
    .expect("valid Subscription")
}

pub fn legacy_type(application: &str, event: &str) -> String {
    format!("{EVENT_TYPE_PREFIX}.{application}.{event}")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// [`SubscriptionStore`] kept in memory with resourceVersion checks
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<BTreeMap<(String, String), Subscription>>,
    services: Mutex<HashSet<(String, String)>>,
    applications: Mutex<HashMap<String, Application>>,
    next_version: AtomicUsize,
    pub status_writes: AtomicUsize,
    pub finalizer_writes: AtomicUsize,
    pub fail_list: AtomicBool,
    conflict_next_write: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self::default());
        store.add_service(NAMESPACE, "sink");
        store
    }

    fn bump(&self, subscription: &mut Subscription) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        subscription.metadata.resource_version = Some(version.to_string());
    }

    fn key(subscription: &Subscription) -> (String, String) {
        (
            subscription.namespace_or_default().to_string(),
            subscription.name_or_default().to_string(),
        )
    }

    pub fn insert(&self, mut subscription: Subscription) -> Subscription {
        self.bump(&mut subscription);
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(&subscription), subscription.clone());
        subscription
    }

    pub fn stored(&self, name: &str) -> Option<Subscription> {
        self.objects
            .lock()
            .unwrap()
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn status(&self, name: &str) -> Option<SubscriptionStatus> {
        self.stored(name).and_then(|s| s.status)
    }

    /// Simulate `kubectl delete`: the API server only sets the timestamp while finalizers remain
    pub fn mark_deleted(&self, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(subscription) = objects.get_mut(&(NAMESPACE.to_string(), name.to_string())) {
            let timestamp = serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
                .expect("valid timestamp");
            subscription.metadata.deletion_timestamp = Some(timestamp);
        }
    }

    /// Replace the spec, as a user edit would
    pub fn edit(&self, name: &str, edit: impl FnOnce(&mut Subscription)) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(subscription) = objects.get_mut(&(NAMESPACE.to_string(), name.to_string())) {
            edit(subscription);
        }
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(subscription) = objects.get_mut(&(NAMESPACE.to_string(), name.to_string())) {
            subscription.metadata.resource_version = Some(version.to_string());
        }
    }

    pub fn add_service(&self, namespace: &str, name: &str) {
        self.services
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
    }

    pub fn add_application(&self, name: &str, type_label: Option<&str>) {
        let mut application = Application::new(name, ApplicationSpec::default());
        if let Some(label) = type_label {
            application.metadata.labels = Some(BTreeMap::from([(
                "application-type".to_string(),
                label.to_string(),
            )]));
        }
        self.applications
            .lock()
            .unwrap()
            .insert(name.to_string(), application);
    }

    /// Make the next write fail with a conflict
    pub fn conflict_next_write(&self) {
        self.conflict_next_write.store(true, Ordering::SeqCst);
    }

    fn check_version(&self, subscription: &Subscription) -> Result<Subscription, StoreError> {
        let target = subscription.namespaced_name();
        if self.conflict_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Conflict(target));
        }
        let objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&Self::key(subscription))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(target.clone()))?;
        if stored.metadata.resource_version != subscription.metadata.resource_version {
            return Err(StoreError::Conflict(target));
        }
        Ok(stored)
    }
}

#[async_trait]
impl ApplicationLookup for FakeStore {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.applications.lock().unwrap().get(name).cloned())
    }
}

#[async_trait]
impl ServiceLookup for FakeStore {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), name.to_string())))
    }
}

#[async_trait]
impl SubscriptionStore for FakeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::Api {
                target: "subscriptions".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.objects.lock().unwrap().values().cloned().collect())
    }

    async fn update_finalizers(
        &self,
        subscription: &Subscription,
        finalizers: Vec<String>,
    ) -> Result<Subscription, StoreError> {
        let mut updated = self.check_version(subscription)?;
        self.finalizer_writes.fetch_add(1, Ordering::SeqCst);
        updated.metadata.finalizers = Some(finalizers);
        self.bump(&mut updated);

        let mut objects = self.objects.lock().unwrap();
        if updated.is_being_deleted() && updated.finalizers().is_empty() {
            objects.remove(&Self::key(&updated));
        } else {
            objects.insert(Self::key(&updated), updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(
        &self,
        subscription: &Subscription,
        status: &SubscriptionStatus,
    ) -> Result<Subscription, StoreError> {
        let mut updated = self.check_version(subscription)?;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        updated.status = Some(status.clone());
        self.bump(&mut updated);
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(&updated), updated.clone());
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct RecordingEventPublisher {
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.warning)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

// ---------------------------------------------------------------------------
// JetStream
// ---------------------------------------------------------------------------

/// Consumers on a single fake stream
#[derive(Default)]
pub struct FakeJetStreamClient {
    pub consumers: Mutex<HashMap<String, ConsumerInfo>>,
    pub connected: AtomicBool,
    pub fail_create: AtomicBool,
    pub streams_ensured: AtomicUsize,
    pub infos: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FakeJetStreamClient {
    pub fn new() -> Arc<Self> {
        let client = Arc::new(Self::default());
        client.connected.store(true, Ordering::SeqCst);
        client
    }

    /// Total broker calls that read or mutate consumers
    pub fn calls(&self) -> usize {
        self.infos.load(Ordering::SeqCst)
            + self.creates.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    pub fn consumer(&self, name: &str) -> Option<ConsumerInfo> {
        self.consumers.lock().unwrap().get(name).cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .consumers
            .lock()
            .unwrap()
            .values()
            .map(|c| c.filter_subject.clone())
            .collect();
        subjects.sort();
        subjects
    }

    pub fn insert_consumer(&self, name: &str, subject: &str, max_ack_pending: i64) {
        self.consumers.lock().unwrap().insert(
            name.to_string(),
            ConsumerInfo {
                name: name.to_string(),
                filter_subject: subject.to_string(),
                max_ack_pending,
            },
        );
    }
}

#[async_trait]
impl JetStreamClient for FakeJetStreamClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_stream(&self, _settings: &StreamSettings) -> Result<(), BackendError> {
        self.streams_ensured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consumer_names(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.consumers.lock().unwrap().keys().cloned().collect())
    }

    async fn consumer_info(&self, name: &str) -> Result<Option<ConsumerInfo>, BackendError> {
        self.infos.fetch_add(1, Ordering::SeqCst);
        Ok(self.consumer(name))
    }

    async fn create_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Broker {
                operation: "create_consumer",
                message: "insufficient resources".to_string(),
            });
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.insert_consumer(
            &settings.name,
            &settings.filter_subject,
            settings.max_ack_pending,
        );
        Ok(())
    }

    async fn update_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.insert_consumer(
            &settings.name,
            &settings.filter_subject,
            settings.max_ack_pending,
        );
        Ok(())
    }

    async fn delete_consumer(&self, name: &str) -> Result<bool, BackendError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(self.consumers.lock().unwrap().remove(name).is_some())
    }
}

/// Hands out the same client on every connect and keeps the closed handler
pub struct FakeJetStreamConnector {
    pub client: Arc<FakeJetStreamClient>,
    pub connects: AtomicUsize,
    on_closed: Mutex<Option<ConnectionClosedHandler>>,
}

impl FakeJetStreamConnector {
    pub fn new(client: Arc<FakeJetStreamClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            connects: AtomicUsize::new(0),
            on_closed: Mutex::new(None),
        })
    }

    /// Fire the closed callback the backend registered
    pub async fn close(&self) {
        let handler = self.on_closed.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler().await;
        }
    }
}

#[async_trait]
impl JetStreamConnector for FakeJetStreamConnector {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn JetStreamClient>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.on_closed.lock().unwrap() = Some(on_closed);
        Ok(Arc::clone(&self.client) as Arc<dyn JetStreamClient>)
    }
}

// ---------------------------------------------------------------------------
// NATS core
// ---------------------------------------------------------------------------

/// Live queue subscriptions by (subject, queue group)
#[derive(Default)]
pub struct FakeCoreClient {
    pub active: Arc<Mutex<HashMap<(String, String), usize>>>,
    pub connected: AtomicBool,
    pub subscribes: AtomicUsize,
}

impl FakeCoreClient {
    pub fn new() -> Arc<Self> {
        let client = Arc::new(Self::default());
        client.connected.store(true, Ordering::SeqCst);
        client
    }

    pub fn active_for(&self, subject: &str) -> usize {
        self.active
            .lock()
            .unwrap()
            .iter()
            .filter(|((s, _), _)| s == subject)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn total_active(&self) -> usize {
        self.active.lock().unwrap().values().sum()
    }

    pub fn queue_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .active
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|((_, group), _)| group.clone())
            .collect();
        groups.sort();
        groups
    }
}

struct FakeCoreSubscription {
    active: Arc<Mutex<HashMap<(String, String), usize>>>,
    key: (String, String),
}

#[async_trait]
impl CoreSubscription for FakeCoreSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), BackendError> {
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}

#[async_trait]
impl CoreClient for FakeCoreClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn CoreSubscription>, BackendError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let key = (subject.to_string(), queue_group.to_string());
        *self.active.lock().unwrap().entry(key.clone()).or_default() += 1;
        Ok(Box::new(FakeCoreSubscription {
            active: Arc::clone(&self.active),
            key,
        }))
    }
}

pub struct FakeCoreConnector {
    pub client: Arc<FakeCoreClient>,
    pub connects: AtomicUsize,
    on_closed: Mutex<Option<ConnectionClosedHandler>>,
}

impl FakeCoreConnector {
    pub fn new(client: Arc<FakeCoreClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            connects: AtomicUsize::new(0),
            on_closed: Mutex::new(None),
        })
    }

    pub async fn close(&self) {
        let handler = self.on_closed.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler().await;
        }
    }
}

#[async_trait]
impl CoreConnector for FakeCoreConnector {
    async fn connect(
        &self,
        _config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn CoreClient>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.on_closed.lock().unwrap() = Some(on_closed);
        Ok(Arc::clone(&self.client) as Arc<dyn CoreClient>)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn broker_config(backend: BackendKind) -> BrokerConfig {
    BrokerConfig {
        backend,
        event_type_prefix: EVENT_TYPE_PREFIX.to_string(),
        ..BrokerConfig::default()
    }
}

/// A handler that does nothing, for backends whose closure is not under test
pub fn noop_closed_handler() -> ConnectionClosedHandler {
    Arc::new(|| async {}.boxed())
}

pub async fn jetstream_backend(
    connector: &Arc<FakeJetStreamConnector>,
) -> Arc<JetStreamBackend> {
    let backend = JetStreamBackend::new(
        broker_config(BackendKind::JetStream),
        Arc::clone(connector) as Arc<dyn JetStreamConnector>,
    );
    backend
        .initialize(noop_closed_handler())
        .await
        .expect("initialize");
    Arc::new(backend)
}

pub async fn core_backend(connector: &Arc<FakeCoreConnector>) -> Arc<NatsCoreBackend> {
    let backend = NatsCoreBackend::new(
        broker_config(BackendKind::NatsCore),
        Arc::clone(connector) as Arc<dyn CoreConnector>,
    );
    backend
        .initialize(noop_closed_handler())
        .await
        .expect("initialize");
    Arc::new(backend)
}

pub fn reconciler(
    store: &Arc<FakeStore>,
    backend: Arc<dyn BrokerBackend>,
    events: &Arc<RecordingEventPublisher>,
) -> Arc<Reconciler> {
    let kind = backend.kind();
    let cleaner = EventTypeCleaner::new(
        EVENT_TYPE_PREFIX,
        Some(Arc::clone(store) as Arc<dyn ApplicationLookup>),
    )
    .expect("cleaner");
    Arc::new(Reconciler::new(
        Arc::clone(store) as Arc<dyn SubscriptionStore>,
        backend,
        cleaner,
        SinkValidator::new(Arc::clone(store) as Arc<dyn ServiceLookup>),
        Arc::clone(events) as Arc<dyn EventPublisher>,
        ControllerConfig::default(),
        &broker_config(kind),
    ))
}
