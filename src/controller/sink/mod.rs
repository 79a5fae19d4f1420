//! # Sink Validation
//!
//! A sink must point at a Service in the Subscription's own namespace, addressed
//! through its cluster-local DNS name
//! (`<service>.<namespace>.svc.cluster.local`). Checks run in a fixed order and
//! the first failure is reported.

use crate::constants::CLUSTER_LOCAL_URL_SUFFIX;
use crate::controller::store::ServiceLookup;
use crate::crd::Subscription;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// `service.namespace.svc.cluster.local`
const CLUSTER_LOCAL_LABEL_COUNT: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkValidationError {
    #[error("sink URL scheme should be 'http' or 'https'")]
    InvalidScheme,
    #[error("not able to parse sink url with error: {0}")]
    Unparseable(String),
    #[error("sink does not contain suffix: svc.cluster.local in the URL")]
    MissingClusterLocalSuffix,
    #[error("sink should contain 5 sub-domains: {0}")]
    WrongSubdomainCount(String),
    #[error("namespace of subscription: {subscription} and the namespace of subscriber: {subscriber} are different")]
    NamespaceMismatch {
        subscription: String,
        subscriber: String,
    },
    #[error("sink is not valid cluster local svc, failed with error: fetch cluster-local svc failed namespace:{namespace} name:{name}")]
    ServiceNotFound { namespace: String, name: String },
}

impl SinkValidationError {
    /// Short machine-readable reason, used as a metrics label
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            SinkValidationError::InvalidScheme => "invalid_scheme",
            SinkValidationError::Unparseable(_) => "unparseable",
            SinkValidationError::MissingClusterLocalSuffix => "missing_suffix",
            SinkValidationError::WrongSubdomainCount(_) => "subdomain_count",
            SinkValidationError::NamespaceMismatch { .. } => "namespace_mismatch",
            SinkValidationError::ServiceNotFound { .. } => "service_not_found",
        }
    }
}

/// Validates `spec.sink` of a Subscription
#[derive(Clone)]
pub struct SinkValidator {
    services: Arc<dyn ServiceLookup>,
}

impl std::fmt::Debug for SinkValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkValidator").finish_non_exhaustive()
    }
}

impl SinkValidator {
    #[must_use]
    pub fn new(services: Arc<dyn ServiceLookup>) -> Self {
        Self { services }
    }

    /// # Errors
    ///
    /// The first failed check as a [`SinkValidationError`]. A failing Service
    /// lookup is reported as [`SinkValidationError::ServiceNotFound`].
    pub async fn validate(&self, subscription: &Subscription) -> Result<(), SinkValidationError> {
        let target = check_shape(&subscription.spec.sink, subscription.namespace_or_default())?;

        let exists = match self
            .services
            .service_exists(&target.namespace, &target.service)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                debug!(error = %e, "Service lookup for sink failed");
                false
            }
        };

        if exists {
            Ok(())
        } else {
            Err(SinkValidationError::ServiceNotFound {
                namespace: target.namespace,
                name: target.service,
            })
        }
    }
}

/// Service addressed by a well-formed sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    pub service: String,
    pub namespace: String,
}

/// Every check except the Service existence lookup
///
/// # Errors
///
/// The first failed check as a [`SinkValidationError`].
pub fn check_shape(sink: &str, namespace: &str) -> Result<SinkTarget, SinkValidationError> {
    if !(sink.starts_with("http://") || sink.starts_with("https://")) {
        return Err(SinkValidationError::InvalidScheme);
    }

    let url = Url::parse(sink).map_err(|e| SinkValidationError::Unparseable(e.to_string()))?;
    // Url::host_str never includes the port
    let host = url.host_str().unwrap_or_default();

    if !host.ends_with(CLUSTER_LOCAL_URL_SUFFIX) {
        return Err(SinkValidationError::MissingClusterLocalSuffix);
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() != CLUSTER_LOCAL_LABEL_COUNT {
        return Err(SinkValidationError::WrongSubdomainCount(host.to_string()));
    }

    if labels[1] != namespace {
        return Err(SinkValidationError::NamespaceMismatch {
            subscription: namespace.to_string(),
            subscriber: labels[1].to_string(),
        });
    }

    Ok(SinkTarget {
        service: labels[0].to_string(),
        namespace: labels[1].to_string(),
    })
}
