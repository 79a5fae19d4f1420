//! # Subject and Consumer Naming
//!
//! Subjects and consumer names are derived, never stored as the source of truth.
//! A consumer name is the hex MD5 of `namespace/name/subject`: 32 characters,
//! well inside JetStream's durable-name limit, and stable across reconciles.
//! Mapping a consumer back to its Subscription goes through the backend
//! registry keyed by [`ConsumerKey`], not through the name.

use crate::crd::{BackendType, EventType, Subscription, TypeMatching};

/// Owner and subject of one broker consumer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerKey {
    pub namespace: String,
    pub name: String,
    pub subject: String,
}

impl ConsumerKey {
    #[must_use]
    pub fn new(subscription: &Subscription, subject: &str) -> Self {
        Self {
            namespace: subscription.namespace_or_default().to_string(),
            name: subscription.name_or_default().to_string(),
            subject: subject.to_string(),
        }
    }

    /// `namespace/name/subject`; doubles as the NATS queue group
    #[must_use]
    pub fn identifier(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.name, self.subject)
    }

    #[must_use]
    pub fn consumer_name(&self) -> String {
        compute_consumer_name(&self.namespace, &self.name, &self.subject)
    }
}

/// Hex MD5 of `namespace/name/subject`
#[must_use]
pub fn compute_consumer_name(namespace: &str, name: &str, subject: &str) -> String {
    format!("{:x}", md5::compute(format!("{namespace}/{name}/{subject}")))
}

/// Wire subject for one cleaned event type
///
/// Standard matching scopes the type under the source, exact matching uses it
/// verbatim. `clean_source` must already be restricted to `[a-zA-Z0-9-]`.
#[must_use]
pub fn subject_for(
    prefix: &str,
    clean_source: &str,
    clean_type: &str,
    matching: TypeMatching,
) -> String {
    let body = match matching {
        TypeMatching::Standard if !clean_source.is_empty() => {
            format!("{clean_source}.{clean_type}")
        }
        TypeMatching::Standard | TypeMatching::Exact => clean_type.to_string(),
    };
    if prefix.is_empty() {
        body
    } else {
        format!("{prefix}.{body}")
    }
}

/// One [`BackendType`] per unique subject, in type order
#[must_use]
pub fn backend_types(
    subscription: &Subscription,
    types: &[EventType],
    prefix: &str,
    clean_source: &str,
) -> Vec<BackendType> {
    let mut result: Vec<BackendType> = Vec::with_capacity(types.len());
    for event_type in types {
        let subject = subject_for(
            prefix,
            clean_source,
            &event_type.clean_type,
            subscription.spec.type_matching,
        );
        if result.iter().any(|t| t.subject == subject) {
            continue;
        }
        result.push(BackendType {
            original_type: event_type.original_type.clone(),
            consumer_name: ConsumerKey::new(subscription, &subject).consumer_name(),
            subject,
        });
    }
    result
}
