//! # Configuration
//!
//! Process-wide settings loaded from environment variables at startup.
//!
//! - `controller.rs` - reconciliation, backoff and HTTP server settings
//! - `broker.rs` - NATS / JetStream connection and stream settings

mod broker;
mod controller;

pub use broker::{
    BackendKind, BrokerConfig, ConfigError, DeliverPolicy, DiscardPolicy, RetentionPolicy,
    StorageType, StreamSettings,
};
pub use controller::ControllerConfig;

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
pub(crate) fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Read environment variable as string or return default
pub(crate) fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
