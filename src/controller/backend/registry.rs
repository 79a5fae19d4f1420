//! # Consumer Registry
//!
//! Broker-side state tracked per Subscription. Every Subscription has its own
//! lock; the map lock is only taken to look up, insert or drop an entry and is
//! never held across a broker call. Reconciles of different Subscriptions
//! therefore run their broker calls in parallel, while two passes over the same
//! Subscription are serialized.

use crate::controller::backend::naming::ConsumerKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Consumers of one Subscription, keyed by subject
pub(crate) type Entry<T> = Arc<Mutex<HashMap<ConsumerKey, T>>>;

pub(crate) struct ConsumerRegistry<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    active: AtomicUsize,
}

impl<T> Default for ConsumerRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }
}

fn entry_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl<T> ConsumerRegistry<T> {
    /// Entry for `namespace/name`, created empty if absent
    pub(crate) async fn entry(&self, namespace: &str, name: &str) -> Entry<T> {
        let mut entries = self.entries.lock().await;
        Arc::clone(entries.entry(entry_key(namespace, name)).or_default())
    }

    pub(crate) async fn get(&self, namespace: &str, name: &str) -> Option<Entry<T>> {
        self.entries
            .lock()
            .await
            .get(&entry_key(namespace, name))
            .cloned()
    }

    pub(crate) async fn remove(&self, namespace: &str, name: &str) {
        self.entries.lock().await.remove(&entry_key(namespace, name));
    }

    /// Every entry, for whole-registry scans
    pub(crate) async fn entries(&self) -> Vec<Entry<T>> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Forget everything, e.g. after the connection that owned it died
    ///
    /// Returns how many entries were dropped.
    pub(crate) async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let dropped = entries.len();
        entries.clear();
        self.active.store(0, Ordering::SeqCst);
        dropped
    }

    /// Move the active total by the change one Subscription went through
    ///
    /// Returns the new total.
    pub(crate) fn adjust_active(&self, before: usize, after: usize) -> usize {
        let update = |total: usize| Some(total.saturating_sub(before).saturating_add(after));
        let (Ok(previous) | Err(previous)) =
            self.active
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, update);
        previous.saturating_sub(before).saturating_add(after)
    }
}
