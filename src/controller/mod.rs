//! # Controller
//!
//! Core controller modules for the eventing controller.
//!
//! - `backend`: NATS core and JetStream consumer management
//! - `backoff`: Fibonacci backoff mechanism for retries
//! - `cleaner`: Event type parsing and sanitizing
//! - `reconciler`: Core reconciliation logic
//! - `server`: HTTP server for metrics and health checks
//! - `sink`: Sink URL validation
//! - `store`: Kubernetes API access behind traits

pub mod backend;
pub mod backoff;
pub mod cleaner;
pub mod reconciler;
pub mod server;
pub mod sink;
pub mod store;
