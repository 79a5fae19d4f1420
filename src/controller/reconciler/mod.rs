//! # Reconciler
//!
//! Reconciliation logic for `Subscription` resources.
//!
//! ## Reconciliation Flow
//!
//! 1. Read the Subscription from the API server
//! 2. Deleted: remove broker consumers, then the finalizer
//! 3. No finalizer yet: add it and wait for the next event
//! 4. Clean event types and build subjects
//! 5. Validate the sink
//! 6. Sync consumers with the broker
//! 7. Write status if it changed

pub mod events;
pub mod finalizer;
pub mod reconcile;
pub mod resync;
pub mod status;
pub mod types;

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use reconcile::reconcile;
pub use resync::ResyncTrigger;
pub use types::{BackoffState, Reconciler, ReconcilerError};
