//! Eventing Controller Library
//!
//! Reconciles `Subscription` resources into NATS queue subscriptions or
//! JetStream consumers.
//!
//! ## Quick Start
//!
//! ```rust
//! use eventing_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
