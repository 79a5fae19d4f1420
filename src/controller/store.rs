//! # Object Store
//!
//! The reconciler never talks to the Kubernetes API directly. It goes through
//! [`SubscriptionStore`], which [`KubeStore`] implements against the cluster and
//! the integration tests implement in memory.
//!
//! Writes are merge patches that carry the `resourceVersion` the reconciler
//! read, so a concurrent writer surfaces as [`StoreError::Conflict`] instead of
//! being silently overwritten.

use crate::constants::FIELD_MANAGER;
use crate::crd::{Application, Subscription, SubscriptionStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// The object changed between read and write
    #[error("conflict while updating {0}")]
    Conflict(String),
    #[error("kubernetes API request for {target} failed: {message}")]
    Api { target: String, message: String },
}

impl StoreError {
    /// Map a kube error onto the store taxonomy (404 and 409 get their own variants)
    #[must_use]
    pub fn from_kube(err: kube::Error, target: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(target.to_string()),
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(target.to_string()),
            other => StoreError::Api {
                target: target.to_string(),
                message: other.to_string(),
            },
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Read access to Application resources, used while cleaning event types
#[async_trait]
pub trait ApplicationLookup: Send + Sync {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError>;
}

/// Existence check for Services, used while validating sinks
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError>;
}

/// Get/list/update access to Subscriptions with optimistic concurrency
#[async_trait]
pub trait SubscriptionStore: ApplicationLookup + ServiceLookup {
    /// `Ok(None)` when the object no longer exists
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, StoreError>;

    async fn list(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Replace the finalizer list; returns the object as stored afterwards
    async fn update_finalizers(
        &self,
        subscription: &Subscription,
        finalizers: Vec<String>,
    ) -> Result<Subscription, StoreError>;

    /// Replace the status sub-resource; returns the object as stored afterwards
    async fn update_status(
        &self,
        subscription: &Subscription,
        status: &SubscriptionStatus,
    ) -> Result<Subscription, StoreError>;
}

/// [`SubscriptionStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("client", &"<Client>")
            .finish()
    }
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn subscriptions(&self, namespace: &str) -> Api<Subscription> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ApplicationLookup for KubeStore {
    async fn get_application(&self, name: &str) -> Result<Option<Application>, StoreError> {
        let api: Api<Application> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("application {name}")))
    }
}

#[async_trait]
impl ServiceLookup for KubeStore {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map(|svc| svc.is_some())
            .map_err(|e| StoreError::from_kube(e, &format!("service {namespace}/{name}")))
    }
}

#[async_trait]
impl SubscriptionStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, StoreError> {
        self.subscriptions(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("subscription {namespace}/{name}")))
    }

    async fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        let api: Api<Subscription> = Api::all(self.client.clone());
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| StoreError::from_kube(e, "subscriptions"))
    }

    async fn update_finalizers(
        &self,
        subscription: &Subscription,
        finalizers: Vec<String>,
    ) -> Result<Subscription, StoreError> {
        let target = format!("subscription {}", subscription.namespaced_name());
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": subscription.metadata.resource_version,
                "finalizers": finalizers,
            }
        });

        self.subscriptions(subscription.namespace_or_default())
            .patch(
                subscription.name_or_default(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| StoreError::from_kube(e, &target))
    }

    async fn update_status(
        &self,
        subscription: &Subscription,
        status: &SubscriptionStatus,
    ) -> Result<Subscription, StoreError> {
        let target = format!("subscription {} status", subscription.namespaced_name());
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": subscription.metadata.resource_version,
            },
            "status": status,
        });

        self.subscriptions(subscription.namespace_or_default())
            .patch_status(
                subscription.name_or_default(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| StoreError::from_kube(e, &target))
    }
}
