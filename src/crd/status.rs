//! # Subscription Status
//!
//! Observed state written back by the reconciler.

use crate::crd::SubscriptionConfig;
use serde::{Deserialize, Serialize};

/// Status of the Subscription resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    /// Mirrors the `SubscriptionActive` condition
    #[serde(default)]
    pub ready: bool,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Cleaned event types, in spec order and without duplicates
    #[serde(default)]
    pub types: Vec<EventType>,
    /// Effective config applied to the broker
    #[serde(default)]
    pub config: Option<SubscriptionConfig>,
    /// Broker-level view of the subscription
    #[serde(default)]
    pub backend: Option<BackendStatus>,
}

/// Original event type and its cleaned form
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventType {
    pub original_type: String,
    pub clean_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// One entry per broker consumer
    #[serde(default)]
    pub types: Vec<BackendType>,
}

/// A broker consumer derived from one event type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendType {
    pub original_type: String,
    /// Wire-level subject the consumer filters on
    pub subject: String,
    /// Durable consumer name on the broker
    pub consumer_name: String,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time (RFC3339)
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}
