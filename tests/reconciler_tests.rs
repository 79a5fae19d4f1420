//! # Reconciler Tests
//!
//! Drive `reconcile()` against the in-memory store and fake brokers and check
//! what ends up in status, on the broker and in the event log.

mod common;

use common::*;
use eventing_controller::constants::{
    CONDITION_SUBSCRIPTION_ACTIVE, REASON_SUBSCRIPTION_ACTIVE, REASON_SUBSCRIPTION_NOT_ACTIVE,
    SUBSCRIPTION_FINALIZER,
};
use eventing_controller::controller::backend::{
    BackendError, BrokerBackend, ConsumerKey, JetStreamBackend,
};
use eventing_controller::controller::cleaner::CleanerError;
use eventing_controller::controller::reconciler::{reconcile, Reconciler, ReconcilerError};
use eventing_controller::controller::sink::SinkValidationError;
use eventing_controller::runtime::error_policy::handle_reconciliation_error;
use eventing_controller::runtime::initialization::cleanup_dangling_consumers;
use kube_runtime::controller::Action;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const ORDER_CREATED_SUBJECT: &str = "kyma.commerce.sap.kyma.custom.commerce.order.created.v1";

struct Harness {
    store: Arc<FakeStore>,
    client: Arc<FakeJetStreamClient>,
    events: Arc<RecordingEventPublisher>,
    ctx: Arc<Reconciler>,
}

async fn harness() -> Harness {
    let store = FakeStore::new();
    let client = FakeJetStreamClient::new();
    let connector = FakeJetStreamConnector::new(Arc::clone(&client));
    let backend = jetstream_backend(&connector).await;
    let events = Arc::new(RecordingEventPublisher::default());
    let ctx = reconciler(&store, backend, &events);
    Harness {
        store,
        client,
        events,
        ctx,
    }
}

impl Harness {
    async fn reconcile(&self, name: &str) -> Result<Action, ReconcilerError> {
        let object = self
            .store
            .stored(name)
            .unwrap_or_else(|| subscription(name, &[]));
        reconcile(Arc::new(object), Arc::clone(&self.ctx)).await
    }

    /// Insert and reconcile until the finalizer is set and the first sync ran
    async fn create(&self, name: &str, types: &[&str]) -> Result<Action, ReconcilerError> {
        self.store.insert(subscription(name, types));
        self.reconcile(name).await.expect("finalizer reconcile");
        self.reconcile(name).await
    }
}

fn order_created() -> String {
    legacy_type("commerce", "order.created.v1")
}

#[tokio::test]
async fn test_first_reconcile_only_adds_finalizer() {
    let h = harness().await;
    h.store.insert(subscription("sub", &[&order_created()]));

    let action = h.reconcile("sub").await.unwrap();

    assert_eq!(action, Action::await_change());
    let stored = h.store.stored("sub").unwrap();
    assert_eq!(stored.finalizers(), [SUBSCRIPTION_FINALIZER.to_string()]);
    assert!(stored.status.is_none());
    assert_eq!(h.client.consumer_count(), 0);
}

#[tokio::test]
async fn test_reconcile_creates_consumers_and_marks_active() {
    let h = harness().await;
    let order_created = order_created();
    let order_changed = legacy_type("commerce", "order.changed.v1");

    let action = h.create("sub", &[&order_created, &order_changed]).await.unwrap();
    assert_eq!(action, Action::await_change());

    assert_eq!(
        h.client.subjects(),
        vec![
            "kyma.commerce.sap.kyma.custom.commerce.order.changed.v1".to_string(),
            ORDER_CREATED_SUBJECT.to_string(),
        ]
    );

    let status = h.store.status("sub").unwrap();
    assert!(status.ready);
    assert_eq!(status.types.len(), 2);
    assert_eq!(status.types[0].original_type, order_created);
    assert_eq!(
        status.config.as_ref().and_then(|c| c.max_in_flight_messages),
        Some(10)
    );

    let backend = status.backend.unwrap();
    assert_eq!(backend.types.len(), 2);
    assert_eq!(backend.types[0].subject, ORDER_CREATED_SUBJECT);
    let sub = h.store.stored("sub").unwrap();
    assert_eq!(
        backend.types[0].consumer_name,
        ConsumerKey::new(&sub, ORDER_CREATED_SUBJECT).consumer_name()
    );

    let condition = &status.conditions[0];
    assert_eq!(condition.r#type, CONDITION_SUBSCRIPTION_ACTIVE);
    assert_eq!(condition.status, "True");
    assert_eq!(condition.reason.as_deref(), Some(REASON_SUBSCRIPTION_ACTIVE));
    assert_eq!(h.events.reasons(), vec!["Update".to_string()]);
}

#[tokio::test]
async fn test_steady_state_reconcile_makes_no_writes() {
    let h = harness().await;
    h.create("sub", &[&order_created()]).await.unwrap();

    let status_writes = h.store.status_writes.load(Ordering::SeqCst);
    let broker_calls = h.client.calls();
    let events = h.events.reasons().len();

    for _ in 0..3 {
        h.reconcile("sub").await.unwrap();
    }

    assert_eq!(h.store.status_writes.load(Ordering::SeqCst), status_writes);
    assert_eq!(h.client.calls(), broker_calls);
    assert_eq!(h.events.reasons().len(), events);
}

#[tokio::test]
async fn test_removed_type_deletes_its_consumer() {
    let h = harness().await;
    let order_changed = legacy_type("commerce", "order.changed.v1");
    h.create("sub", &[&order_created(), &order_changed]).await.unwrap();
    assert_eq!(h.client.consumer_count(), 2);

    h.store
        .edit("sub", |s| s.spec.types = vec![order_created()]);
    h.reconcile("sub").await.unwrap();

    assert_eq!(h.client.subjects(), vec![ORDER_CREATED_SUBJECT.to_string()]);
    assert_eq!(h.store.status("sub").unwrap().types.len(), 1);
}

#[tokio::test]
async fn test_max_in_flight_change_updates_consumer() {
    let h = harness().await;
    h.create("sub", &[&order_created()]).await.unwrap();

    h.store.edit("sub", |s| {
        s.spec.config = Some(eventing_controller::crd::SubscriptionConfig {
            max_in_flight_messages: Some(3),
        });
    });
    h.reconcile("sub").await.unwrap();

    let name = h.store.status("sub").unwrap().backend.unwrap().types[0]
        .consumer_name
        .clone();
    assert_eq!(h.client.consumer(&name).unwrap().max_ack_pending, 3);
    assert_eq!(h.client.updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.store
            .status("sub")
            .unwrap()
            .config
            .and_then(|c| c.max_in_flight_messages),
        Some(3)
    );
}

#[tokio::test]
async fn test_sink_in_other_namespace_marks_not_active() {
    let h = harness().await;
    h.store.insert(subscription_with(
        "sub",
        &[&order_created()],
        "http://sink.other.svc.cluster.local",
        None,
    ));
    h.reconcile("sub").await.unwrap();

    let err = h.reconcile("sub").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::SinkValidation(SinkValidationError::NamespaceMismatch { .. })
    ));

    let status = h.store.status("sub").unwrap();
    assert!(!status.ready);
    assert_eq!(
        status.conditions[0].reason.as_deref(),
        Some(REASON_SUBSCRIPTION_NOT_ACTIVE)
    );
    assert!(!status.types.is_empty());
    assert_eq!(h.client.consumer_count(), 0);

    let warnings = h.events.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].reason, "ValidationFailed");
}

#[tokio::test]
async fn test_missing_service_marks_not_active() {
    let h = harness().await;
    h.store.insert(subscription_with(
        "sub",
        &[&order_created()],
        "http://gone.test.svc.cluster.local",
        None,
    ));
    h.reconcile("sub").await.unwrap();

    let err = h.reconcile("sub").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::SinkValidation(SinkValidationError::ServiceNotFound { .. })
    ));
    assert!(!h.store.status("sub").unwrap().ready);
}

#[tokio::test]
async fn test_malformed_type_marks_not_active() {
    let h = harness().await;
    let err = h
        .create("sub", &["sap.kyma.custom.commerce.created"])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReconcilerError::Cleaner(CleanerError::InvalidFormat(_))
    ));
    let status = h.store.status("sub").unwrap();
    assert!(!status.ready);
    assert_eq!(h.events.warnings()[0].reason, "ValidationFailed");
    assert_eq!(h.client.consumer_count(), 0);
}

#[tokio::test]
async fn test_broker_failure_records_sync_failed_then_recovers() {
    let h = harness().await;
    h.client.fail_create.store(true, Ordering::SeqCst);

    let err = h.create("sub", &[&order_created()]).await.unwrap_err();
    assert!(matches!(err, ReconcilerError::Backend(_)));

    let failed = h.store.status("sub").unwrap();
    assert!(!failed.ready);
    assert_eq!(h.events.warnings()[0].reason, "SyncFailed");

    h.client.fail_create.store(false, Ordering::SeqCst);
    h.reconcile("sub").await.unwrap();

    let recovered = h.store.status("sub").unwrap();
    assert!(recovered.ready);
    assert_eq!(recovered.conditions.len(), 1);
    assert_eq!(recovered.conditions[0].status, "True");
    assert_eq!(h.client.consumer_count(), 1);
}

#[tokio::test]
async fn test_status_conflict_requeues() {
    let h = harness().await;
    h.store.insert(subscription("sub", &[&order_created()]));
    h.reconcile("sub").await.unwrap();

    h.store.conflict_next_write();
    let action = h.reconcile("sub").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    assert!(h.store.status("sub").is_none());

    h.reconcile("sub").await.unwrap();
    assert!(h.store.status("sub").unwrap().ready);
    assert_eq!(h.client.consumer_count(), 1);
}

#[tokio::test]
async fn test_finalizer_conflict_requeues() {
    let h = harness().await;
    h.store.insert(subscription("sub", &[&order_created()]));
    h.store.conflict_next_write();

    let action = h.reconcile("sub").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    assert!(!h.store.stored("sub").unwrap().has_finalizer());
}

#[tokio::test]
async fn test_deletion_removes_consumers_and_finalizer() {
    let h = harness().await;
    h.create("sub", &[&order_created()]).await.unwrap();
    assert_eq!(h.client.consumer_count(), 1);

    h.store.mark_deleted("sub");
    let action = h.reconcile("sub").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(h.client.consumer_count(), 0);
    assert!(h.store.stored("sub").is_none());
    assert!(h.ctx.backend.tracked_subjects(NAMESPACE, "sub").await.is_empty());
}

#[tokio::test]
async fn test_deleted_before_finalizer_is_left_alone() {
    let h = harness().await;
    h.store.insert(subscription("sub", &[&order_created()]));
    h.store.mark_deleted("sub");

    h.reconcile("sub").await.unwrap();

    assert_eq!(h.store.finalizer_writes.load(Ordering::SeqCst), 0);
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn test_missing_subscription_is_ignored() {
    let h = harness().await;
    let action = h.reconcile("ghost").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn test_application_type_label_used_in_clean_type() {
    let h = harness().await;
    h.store.add_application("commerce", Some("mock-commerce"));

    h.create("sub", &[&order_created()]).await.unwrap();

    let status = h.store.status("sub").unwrap();
    assert_eq!(
        status.types[0].clean_type,
        "sap.kyma.custom.mockcommerce.order.created.v1"
    );
    assert_eq!(
        status.backend.unwrap().types[0].subject,
        "kyma.commerce.sap.kyma.custom.mockcommerce.order.created.v1"
    );
}

#[tokio::test]
async fn test_core_backend_fans_out_queue_subscriptions() {
    let store = FakeStore::new();
    let client = FakeCoreClient::new();
    let connector = FakeCoreConnector::new(Arc::clone(&client));
    let backend = core_backend(&connector).await;
    let events = Arc::new(RecordingEventPublisher::default());
    let ctx = reconciler(&store, backend, &events);

    store.insert(subscription_with("sub", &[&order_created()], SINK, Some(4)));
    for _ in 0..2 {
        let object = store.stored("sub").unwrap();
        reconcile(Arc::new(object), Arc::clone(&ctx)).await.unwrap();
    }

    let subject = "commerce.sap.kyma.custom.commerce.order.created.v1";
    assert_eq!(client.active_for(subject), 4);
    assert_eq!(client.queue_groups(), vec![format!("test/sub/{subject}")]);

    let status = store.status("sub").unwrap();
    assert!(status.ready);
    assert_eq!(status.backend.unwrap().types[0].subject, subject);
}

#[tokio::test]
async fn test_plain_type_lifecycle_on_core_backend() {
    let store = FakeStore::new();
    let client = FakeCoreClient::new();
    let connector = FakeCoreConnector::new(Arc::clone(&client));
    let backend = core_backend(&connector).await;
    let events = Arc::new(RecordingEventPublisher::default());
    let ctx = reconciler(&store, backend, &events);

    store.insert(subscription_from_source(
        "sub",
        "foo",
        &["order.created.v1"],
        SINK,
        Some(1),
    ));
    for _ in 0..2 {
        let object = store.stored("sub").unwrap();
        reconcile(Arc::new(object), Arc::clone(&ctx)).await.unwrap();
    }

    assert_eq!(client.total_active(), 1);
    assert_eq!(client.active_for("foo.order.created.v1"), 1);
    assert_eq!(
        client.queue_groups(),
        vec!["test/sub/foo.order.created.v1".to_string()]
    );
    let status = store.status("sub").unwrap();
    assert!(status.ready);
    assert_eq!(status.types[0].clean_type, "order.created.v1");
    assert_eq!(
        status.backend.unwrap().types[0].subject,
        "foo.order.created.v1"
    );

    store.mark_deleted("sub");
    let object = store.stored("sub").unwrap();
    reconcile(Arc::new(object), Arc::clone(&ctx)).await.unwrap();

    assert_eq!(client.total_active(), 0);
    assert!(store.stored("sub").is_none());
}

#[tokio::test]
async fn test_deletion_drops_backoff_state() {
    let h = harness().await;
    h.create("sub", &[&order_created()]).await.unwrap();

    let object = Arc::new(h.store.stored("sub").unwrap());
    let error = ReconcilerError::Backend(BackendError::NotConnected);
    handle_reconciliation_error(object, &error, Arc::clone(&h.ctx));
    assert!(h.ctx.backoff_states.lock().unwrap().contains_key("test/sub"));

    h.store.mark_deleted("sub");
    h.reconcile("sub").await.unwrap();

    assert!(!h.ctx.backoff_states.lock().unwrap().contains_key("test/sub"));
}

/// Controller stopped, spec edited, controller started against the same broker
async fn restart_after_type_edit(h: &Harness) -> (Arc<JetStreamBackend>, Arc<Reconciler>) {
    h.create("sub", &[&order_created()]).await.unwrap();
    assert_eq!(h.client.subjects(), vec![ORDER_CREATED_SUBJECT.to_string()]);

    h.store
        .edit("sub", |s| s.spec.types = vec![order_deleted()]);

    let connector = FakeJetStreamConnector::new(Arc::clone(&h.client));
    let backend = jetstream_backend(&connector).await;
    let ctx = reconciler(&h.store, Arc::clone(&backend) as Arc<dyn BrokerBackend>, &h.events);
    (backend, ctx)
}

fn order_deleted() -> String {
    legacy_type("commerce", "order.deleted.v1")
}

const ORDER_DELETED_SUBJECT: &str = "kyma.commerce.sap.kyma.custom.commerce.order.deleted.v1";

#[tokio::test]
async fn test_startup_cleanup_removes_consumer_of_type_edited_while_down() {
    let h = harness().await;
    let (backend, ctx) = restart_after_type_edit(&h).await;

    let deleted = cleanup_dangling_consumers(&backend, h.store.as_ref(), &ctx.cleaner)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(h.client.consumer_count(), 0);

    for _ in 0..2 {
        let object = h.store.stored("sub").unwrap();
        reconcile(Arc::new(object), Arc::clone(&ctx)).await.unwrap();
    }
    assert_eq!(h.client.subjects(), vec![ORDER_DELETED_SUBJECT.to_string()]);
}

#[tokio::test]
async fn test_reconcile_after_restart_removes_consumer_recorded_in_status() {
    let h = harness().await;
    let (_backend, ctx) = restart_after_type_edit(&h).await;

    let object = h.store.stored("sub").unwrap();
    reconcile(Arc::new(object), Arc::clone(&ctx)).await.unwrap();

    assert_eq!(h.client.subjects(), vec![ORDER_DELETED_SUBJECT.to_string()]);
    let status = h.store.status("sub").unwrap();
    assert_eq!(
        status.backend.unwrap().types[0].subject,
        ORDER_DELETED_SUBJECT
    );
}
