//! # Custom Resource Definitions
//!
//! CRD types for the eventing controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - Subscription resource and helpers
//! - `status.rs` - Status types written back by the reconciler
//! - `application.rs` - Read-only Application resource used for event type cleaning

mod application;
mod spec;
mod status;

pub use application::{Application, ApplicationSpec};
pub use spec::{Subscription, SubscriptionConfig, SubscriptionSpec, TypeMatching};
pub use status::{BackendStatus, BackendType, Condition, EventType, SubscriptionStatus};
