//! # Event Type Cleaner
//!
//! Normalizes user-supplied event types into the form used on the broker.
//!
//! A legacy event type looks like `<prefix>.<application>.<businessObject>.<operation>.<version>`.
//! The application segment may contain arbitrary characters (and even dots),
//! so it is resolved against the registered Application resources and then
//! stripped down to alphanumerics. The rebuilt type is finally restricted to
//! `[a-zA-Z0-9.]`, which makes cleaning idempotent.

use crate::controller::store::ApplicationLookup;
use crate::crd::{EventType, Subscription, TypeMatching};
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Minimum number of segments after the prefix: application, business object,
/// operation and version
const MIN_EVENT_TYPE_SEGMENTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CleanerError {
    #[error("prefix not found: event type '{event_type}' does not start with '{prefix}'")]
    PrefixNotFound { event_type: String, prefix: String },
    #[error("invalid event type format: '{0}' needs <application>.<businessObject>.<operation>.<version>")]
    InvalidFormat(String),
    #[error("failed to compile sanitizer pattern: {0}")]
    Pattern(String),
}

/// Segments of a legacy event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEventType {
    pub application: String,
    pub business_object: String,
    pub operation: String,
    pub version: String,
}

impl ParsedEventType {
    /// `businessObject.operation`
    #[must_use]
    pub fn event(&self) -> String {
        format!("{}.{}", self.business_object, self.operation)
    }
}

/// Split `event_type` into its segments after removing `prefix`
///
/// # Errors
///
/// [`CleanerError::PrefixNotFound`] when a non-empty prefix is missing and
/// [`CleanerError::InvalidFormat`] when fewer than four segments remain.
pub fn parse(event_type: &str, prefix: &str) -> Result<ParsedEventType, CleanerError> {
    let prefix = prefix.trim_end_matches('.');
    let remainder = if prefix.is_empty() {
        event_type
    } else {
        event_type
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or_else(|| CleanerError::PrefixNotFound {
                event_type: event_type.to_string(),
                prefix: prefix.to_string(),
            })?
    };

    let segments: Vec<&str> = remainder.split('.').collect();
    if segments.len() < MIN_EVENT_TYPE_SEGMENTS {
        return Err(CleanerError::InvalidFormat(event_type.to_string()));
    }

    let n = segments.len();
    Ok(ParsedEventType {
        application: segments[..n - 3].join("."),
        business_object: segments[n - 3].to_string(),
        operation: segments[n - 2].to_string(),
        version: segments[n - 1].to_string(),
    })
}

/// Turns raw event types into clean ones
#[derive(Clone)]
pub struct EventTypeCleaner {
    prefix: String,
    lookup: Option<Arc<dyn ApplicationLookup>>,
    invalid_type_chars: Regex,
    invalid_application_chars: Regex,
    invalid_source_chars: Regex,
}

impl std::fmt::Debug for EventTypeCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeCleaner")
            .field("prefix", &self.prefix)
            .field("lookup_enabled", &self.lookup.is_some())
            .finish_non_exhaustive()
    }
}

impl EventTypeCleaner {
    /// `lookup` is optional; without it the parsed application name is used as-is.
    ///
    /// # Errors
    ///
    /// Returns [`CleanerError::Pattern`] if a sanitizer pattern fails to compile.
    pub fn new(
        prefix: impl Into<String>,
        lookup: Option<Arc<dyn ApplicationLookup>>,
    ) -> Result<Self, CleanerError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CleanerError::Pattern(e.to_string()))
        };
        Ok(Self {
            prefix: prefix.into().trim_end_matches('.').to_string(),
            lookup,
            invalid_type_chars: compile(r"[^a-zA-Z0-9.]+")?,
            invalid_application_chars: compile(r"[^a-zA-Z0-9]+")?,
            invalid_source_chars: compile(r"[^a-zA-Z0-9-]+")?,
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Restrict to `[a-zA-Z0-9.]`
    #[must_use]
    pub fn sanitize(&self, value: &str) -> String {
        self.invalid_type_chars.replace_all(value, "").into_owned()
    }

    /// Restrict to `[a-zA-Z0-9-]`, the alphabet allowed in a subject's source segment
    #[must_use]
    pub fn clean_source(&self, source: &str) -> String {
        self.invalid_source_chars.replace_all(source, "").into_owned()
    }

    fn sanitize_application(&self, name: &str) -> String {
        self.invalid_application_chars
            .replace_all(name, "")
            .into_owned()
    }

    /// Normalize one legacy event type
    ///
    /// # Errors
    ///
    /// Propagates [`parse`] failures. Lookup failures are not errors: the raw
    /// application name is used instead.
    pub async fn clean(&self, event_type: &str) -> Result<String, CleanerError> {
        let parsed = parse(event_type, &self.prefix)?;
        let application = self.resolve_application(&parsed.application).await;
        let application = self.sanitize_application(&application);

        let rebuilt = if self.prefix.is_empty() {
            format!("{application}.{}.{}", parsed.event(), parsed.version)
        } else {
            format!(
                "{}.{application}.{}.{}",
                self.prefix,
                parsed.event(),
                parsed.version
            )
        };
        Ok(self.sanitize(&rebuilt))
    }

    async fn resolve_application(&self, raw_name: &str) -> String {
        let Some(lookup) = self.lookup.as_ref() else {
            return raw_name.to_string();
        };

        match lookup.get_application(raw_name).await {
            Ok(Some(app)) => app
                .type_label()
                .map(str::to_string)
                .or_else(|| app.metadata.name.clone())
                .unwrap_or_else(|| raw_name.to_string()),
            Ok(None) => {
                debug!(application = %raw_name, "No Application registered, using raw name");
                raw_name.to_string()
            }
            Err(e) => {
                warn!(application = %raw_name, error = %e, "Application lookup failed, using raw name");
                raw_name.to_string()
            }
        }
    }

    /// Clean every type on `subscription`, in spec order and without duplicates
    ///
    /// Exact matching keeps types verbatim. Standard matching runs the full
    /// algorithm on types carrying the configured prefix and only sanitizes
    /// the rest.
    ///
    /// # Errors
    ///
    /// The first [`CleanerError`] hit while cleaning a prefixed type.
    pub async fn clean_subscription_types(
        &self,
        subscription: &Subscription,
    ) -> Result<Vec<EventType>, CleanerError> {
        let mut cleaned: Vec<EventType> = Vec::with_capacity(subscription.spec.types.len());

        for original in &subscription.spec.types {
            if cleaned.iter().any(|t| &t.original_type == original) {
                continue;
            }
            let clean_type = match subscription.spec.type_matching {
                TypeMatching::Exact => original.clone(),
                TypeMatching::Standard if self.carries_prefix(original) => {
                    self.clean(original).await?
                }
                TypeMatching::Standard => self.sanitize(original),
            };
            cleaned.push(EventType {
                original_type: original.clone(),
                clean_type,
            });
        }

        Ok(cleaned)
    }

    fn carries_prefix(&self, event_type: &str) -> bool {
        !self.prefix.is_empty()
            && event_type
                .strip_prefix(self.prefix.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    }
}
