//! # Connection-Closed Resync
//!
//! When the broker connection is closed for good the backend reconnects lazily
//! on the next call. Every Subscription is enqueued so consumers get recreated
//! without waiting for a spec change.

use crate::constants::EXIT_CODE_RESYNC_LIST_FAILED;
use crate::controller::backend::ConnectionClosedHandler;
use crate::controller::store::{StoreError, SubscriptionStore};
use crate::crd::Subscription;
use crate::observability::metrics;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Feeds Subscriptions into the controller outside of watch events
///
/// Clones share one channel. The receiving side survives watch restarts.
#[derive(Clone)]
pub struct ResyncTrigger {
    sender: UnboundedSender<ObjectRef<Subscription>>,
    receiver: Arc<Mutex<UnboundedReceiver<ObjectRef<Subscription>>>>,
}

impl std::fmt::Debug for ResyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncTrigger")
            .field("closed", &self.sender.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for ResyncTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncTrigger {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Stream for `Controller::reconcile_on`
    ///
    /// Only one stream should be polled at a time.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, ObjectRef<Subscription>> {
        let receiver = Arc::clone(&self.receiver);
        futures::stream::unfold(receiver, |receiver| async move {
            let next = receiver.lock().await.next().await;
            next.map(|object| (object, receiver))
        })
        .boxed()
    }

    pub fn enqueue(&self, subscription: &Subscription) {
        let object = ObjectRef::new(subscription.name_or_default())
            .within(subscription.namespace_or_default());
        if self.sender.unbounded_send(object).is_err() {
            warn!(
                resource = %subscription.namespaced_name(),
                "Resync channel closed, dropping request"
            );
        }
    }

    /// Enqueue every stored Subscription
    ///
    /// # Errors
    ///
    /// Returns the list error; nothing is enqueued in that case.
    pub async fn resync_all(&self, store: &dyn SubscriptionStore) -> Result<usize, StoreError> {
        let subscriptions = store.list().await?;
        for subscription in &subscriptions {
            self.enqueue(subscription);
        }
        metrics::increment_connection_closed_resyncs();
        info!(count = subscriptions.len(), "Enqueued Subscriptions for resync");
        Ok(subscriptions.len())
    }

    /// Handler for the backend's closed-connection callback
    ///
    /// A failed list leaves consumers missing with no way to find them
    /// again, so the process exits and restarts.
    #[must_use]
    pub fn connection_closed_handler(
        &self,
        store: Arc<dyn SubscriptionStore>,
    ) -> ConnectionClosedHandler {
        let trigger = self.clone();
        Arc::new(move || {
            let trigger = trigger.clone();
            let store = Arc::clone(&store);
            async move {
                warn!("Broker connection closed, resyncing all Subscriptions");
                if let Err(e) = trigger.resync_all(store.as_ref()).await {
                    error!(error = %e, "Failed to list Subscriptions after connection loss, exiting");
                    std::process::exit(EXIT_CODE_RESYNC_LIST_FAILED);
                }
            }
            .boxed()
        })
    }
}
