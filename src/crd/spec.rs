//! # Subscription Spec
//!
//! Desired state of a Subscription and helpers the reconciler uses to read it.

use crate::constants::SUBSCRIPTION_FINALIZER;
use serde::{Deserialize, Serialize};

/// Subscription Custom Resource Definition
///
/// Describes which events to receive and where they should be delivered.
///
/// # Example
///
/// ```yaml
/// apiVersion: eventing.kyma-project.io/v1alpha2
/// kind: Subscription
/// metadata:
///   name: order-created
///   namespace: test
/// spec:
///   source: foo
///   types:
///     - order.created.v1
///   sink: http://eventing-nats.test.svc.cluster.local:8080
///   config:
///     maxInFlightMessages: 5
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Subscription",
    group = "eventing.kyma-project.io",
    version = "v1alpha2",
    namespaced,
    status = "crate::crd::SubscriptionStatus",
    shortname = "sub",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.ready"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    /// Optional external identifier
    #[serde(default)]
    pub id: Option<String>,
    /// Target URL events are delivered to
    /// Must be a cluster-local service in the Subscription's namespace
    pub sink: String,
    /// How `types` are matched against published events
    #[serde(default)]
    pub type_matching: TypeMatching,
    /// Origin of the events
    pub source: String,
    /// Event types to receive
    pub types: Vec<String>,
    /// Delivery tuning, merged with process-wide defaults
    #[serde(default)]
    pub config: Option<SubscriptionConfig>,
}

/// Matching mode for event types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TypeMatching {
    /// Types are cleaned and scoped under the source
    #[default]
    Standard,
    /// Types are used verbatim
    Exact,
}

/// Delivery tuning for a Subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    /// Upper bound of unacknowledged messages per consumer
    #[serde(default)]
    pub max_in_flight_messages: Option<i64>,
}

impl Subscription {
    /// Finalizers currently set on the object
    #[must_use]
    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    /// Whether the domain finalizer is present
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == SUBSCRIPTION_FINALIZER)
    }

    /// Whether the API server has marked the object for deletion
    #[must_use]
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn name_or_default(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    #[must_use]
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// `namespace/name`, used as the key for backoff state and broker queue groups
    #[must_use]
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_or_default())
    }

    /// Max-in-flight from the spec, or `default` when unset or not positive
    #[must_use]
    pub fn effective_max_in_flight(&self, default: i64) -> i64 {
        self.spec
            .config
            .as_ref()
            .and_then(|c| c.max_in_flight_messages)
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    /// Spec config merged with process-wide defaults
    #[must_use]
    pub fn merged_config(&self, default_max_in_flight: i64) -> SubscriptionConfig {
        SubscriptionConfig {
            max_in_flight_messages: Some(self.effective_max_in_flight(default_max_in_flight)),
        }
    }
}
