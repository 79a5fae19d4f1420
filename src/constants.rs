//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable.

/// Finalizer placed on every Subscription while broker-side resources may exist
pub const SUBSCRIPTION_FINALIZER: &str = "eventing.kyma-project.io";

/// Field manager used for finalizer and status patches
pub const FIELD_MANAGER: &str = "eventing-controller";

/// Name reported on Kubernetes events
pub const CONTROLLER_NAME: &str = "eventing-controller";

/// Condition type mirrored by `status.ready`
pub const CONDITION_SUBSCRIPTION_ACTIVE: &str = "SubscriptionActive";

/// Condition reason when the broker consumers are in place
pub const REASON_SUBSCRIPTION_ACTIVE: &str = "NATSSubscriptionActive";

/// Condition reason when the broker consumers are missing or failing
pub const REASON_SUBSCRIPTION_NOT_ACTIVE: &str = "NATSSubscriptionNotActive";

/// Host suffix every sink must carry
pub const CLUSTER_LOCAL_URL_SUFFIX: &str = "svc.cluster.local";

/// Label on Application resources holding the canonical application type
pub const APPLICATION_TYPE_LABEL: &str = "application-type";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default number of Subscriptions reconciled in parallel
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Default lower bound of the per-resource error backoff (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 1;

/// Default upper bound of the per-resource error backoff (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;

/// Default requeue delay after an optimistic-concurrency conflict (seconds)
pub const DEFAULT_CONFLICT_REQUEUE_SECS: u64 = 1;

/// Default delay before restarting watch stream after it ends (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_AFTER_END_SECS: u64 = 1;

/// Default NATS server URL
pub const DEFAULT_NATS_URL: &str = "nats://eventing-nats.kyma-system.svc.cluster.local:4222";

/// Default number of reconnect attempts before the connection is declared closed
pub const DEFAULT_MAX_RECONNECTS: usize = 10;

/// Default wait between reconnect attempts (seconds)
pub const DEFAULT_RECONNECT_WAIT_SECS: u64 = 3;

/// Default max-in-flight messages when a Subscription does not override it
pub const DEFAULT_MAX_IN_FLIGHT_MESSAGES: i64 = 10;

/// Default JetStream stream name
pub const DEFAULT_JS_STREAM_NAME: &str = "kyma";

/// Default JetStream subject prefix
pub const DEFAULT_JS_SUBJECT_PREFIX: &str = "kyma";

/// JetStream rejects stream names longer than this
pub const JS_MAX_STREAM_NAME_LENGTH: usize = 32;

/// Ack wait applied to every JetStream consumer (seconds)
pub const JS_CONSUMER_ACK_WAIT_SECS: u64 = 30;

/// Redelivery limit applied to every JetStream consumer
pub const JS_CONSUMER_MAX_DELIVER: i64 = 100;

/// Process exit code used when the connection-loss resync cannot list Subscriptions
pub const EXIT_CODE_RESYNC_LIST_FAILED: i32 = 70;
