//! # Broker Configuration
//!
//! Connection, subject and stream settings for the NATS core and JetStream
//! backends. Values come from environment variables and are validated once at
//! startup so the backends never see an inconsistent configuration.

use super::{env_var_or_default, env_var_or_default_str};
use crate::constants::{
    DEFAULT_JS_STREAM_NAME, DEFAULT_JS_SUBJECT_PREFIX, DEFAULT_MAX_IN_FLIGHT_MESSAGES,
    DEFAULT_MAX_RECONNECTS, DEFAULT_NATS_URL, DEFAULT_RECONNECT_WAIT_SECS,
    JS_MAX_STREAM_NAME_LENGTH,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}, expected one of: {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("stream name '{0}' must be between 1 and 32 characters")]
    StreamNameLength(String),
    #[error("default max in-flight messages must be positive, got {0}")]
    MaxInFlight(i64),
    #[error("NATS URL must not be empty")]
    EmptyUrl,
}

/// Which broker integration the controller runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NatsCore,
    JetStream,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NatsCore => "nats",
            BackendKind::JetStream => "jetstream",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nats" | "nats-core" => Ok(BackendKind::NatsCore),
            "jetstream" => Ok(BackendKind::JetStream),
            _ => Err(ConfigError::InvalidValue {
                key: "BACKEND",
                value: s.to_string(),
                expected: "nats, jetstream",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    File,
}

impl FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StorageType::Memory),
            "file" => Ok(StorageType::File),
            _ => Err(ConfigError::InvalidValue {
                key: "JS_STREAM_STORAGE_TYPE",
                value: s.to_string(),
                expected: "memory, file",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    Limits,
    Interest,
}

impl FromStr for RetentionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "limits" => Ok(RetentionPolicy::Limits),
            "interest" => Ok(RetentionPolicy::Interest),
            _ => Err(ConfigError::InvalidValue {
                key: "JS_STREAM_RETENTION_POLICY",
                value: s.to_string(),
                expected: "limits, interest",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPolicy {
    New,
    Old,
}

impl FromStr for DiscardPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(DiscardPolicy::New),
            "old" => Ok(DiscardPolicy::Old),
            _ => Err(ConfigError::InvalidValue {
                key: "JS_STREAM_DISCARD_POLICY",
                value: s.to_string(),
                expected: "new, old",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    Last,
    LastPerSubject,
    New,
}

impl FromStr for DeliverPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(DeliverPolicy::All),
            "last" => Ok(DeliverPolicy::Last),
            "last_per_subject" => Ok(DeliverPolicy::LastPerSubject),
            "new" => Ok(DeliverPolicy::New),
            _ => Err(ConfigError::InvalidValue {
                key: "JS_CONSUMER_DELIVER_POLICY",
                value: s.to_string(),
                expected: "all, last, last_per_subject, new",
            }),
        }
    }
}

/// Desired JetStream stream shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub name: String,
    pub subject_prefix: String,
    pub storage: StorageType,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    /// -1 means unlimited
    pub max_messages: i64,
    /// -1 means unlimited
    pub max_bytes: i64,
    pub deliver_policy: DeliverPolicy,
}

impl StreamSettings {
    /// Subjects bound to the stream: everything below the prefix
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        if self.subject_prefix.is_empty() {
            vec![">".to_string()]
        } else {
            vec![format!("{}.>", self.subject_prefix)]
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_JS_STREAM_NAME.to_string(),
            subject_prefix: DEFAULT_JS_SUBJECT_PREFIX.to_string(),
            storage: StorageType::Memory,
            retention: RetentionPolicy::Interest,
            discard: DiscardPolicy::New,
            max_messages: -1,
            max_bytes: -1,
            deliver_policy: DeliverPolicy::New,
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: BackendKind,
    pub url: String,
    /// Reconnect attempts before the connection is closed for good
    pub max_reconnects: usize,
    pub reconnect_wait: Duration,
    /// Prefix legacy event types carry, e.g. `sap.kyma.custom`
    pub event_type_prefix: String,
    pub default_max_in_flight: i64,
    pub stream: StreamSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::JetStream,
            url: DEFAULT_NATS_URL.to_string(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: Duration::from_secs(DEFAULT_RECONNECT_WAIT_SECS),
            event_type_prefix: String::new(),
            default_max_in_flight: DEFAULT_MAX_IN_FLIGHT_MESSAGES,
            stream: StreamSettings::default(),
        }
    }
}

impl BrokerConfig {
    /// Load and validate broker settings from the environment
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an enum-like variable holds an unknown value
    /// or when the resulting configuration fails [`BrokerConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let stream_defaults = defaults.stream.clone();

        let config = Self {
            backend: env_var_or_default_str("BACKEND", defaults.backend.as_str()).parse()?,
            url: env_var_or_default_str("NATS_URL", &defaults.url),
            max_reconnects: env_var_or_default("MAX_RECONNECTS", defaults.max_reconnects),
            reconnect_wait: Duration::from_secs(env_var_or_default(
                "RECONNECT_WAIT_SECS",
                defaults.reconnect_wait.as_secs(),
            )),
            event_type_prefix: env_var_or_default_str("EVENT_TYPE_PREFIX", ""),
            default_max_in_flight: env_var_or_default(
                "DEFAULT_MAX_IN_FLIGHT_MESSAGES",
                defaults.default_max_in_flight,
            ),
            stream: StreamSettings {
                name: env_var_or_default_str("JS_STREAM_NAME", &stream_defaults.name),
                subject_prefix: env_var_or_default_str(
                    "JS_SUBJECT_PREFIX",
                    &stream_defaults.subject_prefix,
                ),
                storage: env_var_or_default_str("JS_STREAM_STORAGE_TYPE", "memory").parse()?,
                retention: env_var_or_default_str("JS_STREAM_RETENTION_POLICY", "interest")
                    .parse()?,
                discard: env_var_or_default_str("JS_STREAM_DISCARD_POLICY", "new").parse()?,
                max_messages: env_var_or_default(
                    "JS_STREAM_MAX_MESSAGES",
                    stream_defaults.max_messages,
                ),
                max_bytes: env_var_or_default("JS_STREAM_MAX_BYTES", stream_defaults.max_bytes),
                deliver_policy: env_var_or_default_str("JS_CONSUMER_DELIVER_POLICY", "new")
                    .parse()?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the broker would otherwise reject at runtime
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty URL, an empty or over-long stream
    /// name, or a non-positive default max-in-flight.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        if self.backend == BackendKind::JetStream
            && (self.stream.name.is_empty() || self.stream.name.len() > JS_MAX_STREAM_NAME_LENGTH)
        {
            return Err(ConfigError::StreamNameLength(self.stream.name.clone()));
        }
        if self.default_max_in_flight <= 0 {
            return Err(ConfigError::MaxInFlight(self.default_max_in_flight));
        }
        Ok(())
    }

    /// Subject prefix the selected backend places in front of every subject
    #[must_use]
    pub fn subject_prefix(&self) -> &str {
        match self.backend {
            BackendKind::NatsCore => "",
            BackendKind::JetStream => &self.stream.subject_prefix,
        }
    }
}
