//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use eventing_controller::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Reconciler types
pub use crate::controller::reconciler::{
    reconcile, BackoffState, EventPublisher, Reconciler, ReconcilerError, ResyncTrigger,
};

// Broker seams
pub use crate::controller::backend::{
    BackendError, BrokerBackend, JetStreamBackend, NatsCoreBackend, SyncRequest,
};
pub use crate::controller::store::{
    ApplicationLookup, ServiceLookup, StoreError, SubscriptionStore,
};

// Config types
pub use crate::config::{BackendKind, BrokerConfig, ConfigError, ControllerConfig};
