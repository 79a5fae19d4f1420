//! # Application
//!
//! Cluster-scoped resource registered by the application connector. The
//! controller only reads it to resolve the canonical application name while
//! cleaning event types.

use crate::constants::APPLICATION_TYPE_LABEL;
use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Application",
    group = "applicationconnector.kyma-project.io",
    version = "v1alpha1"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub description: Option<String>,
}

impl Application {
    /// Value of the `application-type` label, if set and non-empty
    #[must_use]
    pub fn type_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(APPLICATION_TYPE_LABEL))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
