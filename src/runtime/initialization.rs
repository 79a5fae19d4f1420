//! # Initialization
//!
//! Controller initialization: rustls, tracing, metrics, configuration, the
//! health server, the Kubernetes client and the broker backend.

use crate::config::{BackendKind, BrokerConfig, ControllerConfig};
use crate::constants::CONTROLLER_NAME;
use crate::controller::backend::{
    BrokerBackend, JetStreamBackend, NatsCoreBackend, NatsConnector, NatsJetStreamConnector,
};
use crate::controller::cleaner::EventTypeCleaner;
use crate::controller::reconciler::status::desired_backend_types;
use crate::controller::reconciler::{KubeEventPublisher, Reconciler, ResyncTrigger};
use crate::controller::server::{start_server, ServerState};
use crate::controller::sink::SinkValidator;
use crate::controller::store::{ApplicationLookup, KubeStore, ServiceLookup, SubscriptionStore};
use crate::crd::Subscription;
use crate::observability;
use anyhow::{Context, Result};
use kube::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    /// Connection-closed resyncs are fed through this into the controller
    pub resync: ResyncTrigger,
    pub controller_config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("backend", &self.reconciler.backend.kind())
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// Any error returned here is fatal: the process should exit non-zero.
pub async fn initialize() -> Result<InitializationResult> {
    // Required for rustls 0.23+ before any TLS connection is made
    let provider_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventing_controller=info".into()),
        )
        .init();

    if !provider_installed {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting Eventing Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let controller_config = ControllerConfig::from_env();
    let broker_config = BrokerConfig::from_env().context("Invalid broker configuration")?;
    info!(
        backend = %broker_config.backend,
        url = %broker_config.url,
        event_type_prefix = %broker_config.event_type_prefix,
        "Loaded configuration"
    );

    let server_state = Arc::new(ServerState::new());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = controller_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &controller_config).await?;

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone()));

    let lookup: Option<Arc<dyn ApplicationLookup>> = if controller_config.application_lookup_enabled
    {
        Some(Arc::clone(&store) as Arc<dyn ApplicationLookup>)
    } else {
        None
    };
    let cleaner = EventTypeCleaner::new(broker_config.event_type_prefix.clone(), lookup)?;
    let sink_validator = SinkValidator::new(Arc::clone(&store) as Arc<dyn ServiceLookup>);
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

    let resync = ResyncTrigger::new();
    let on_closed = resync.connection_closed_handler(Arc::clone(&store) as Arc<dyn SubscriptionStore>);

    let backend: Arc<dyn BrokerBackend> = match broker_config.backend {
        BackendKind::NatsCore => {
            let backend =
                NatsCoreBackend::new(broker_config.clone(), Arc::new(NatsConnector));
            backend
                .initialize(on_closed)
                .await
                .context("Failed to connect to NATS")?;
            Arc::new(backend)
        }
        BackendKind::JetStream => {
            let backend =
                JetStreamBackend::new(broker_config.clone(), Arc::new(NatsJetStreamConnector));
            backend
                .initialize(on_closed)
                .await
                .context("Failed to connect to JetStream")?;
            let cleanup = cleanup_dangling_consumers(&backend, store.as_ref(), &cleaner)
                .instrument(tracing::info_span!(
                    "controller.startup.cleanup_consumers",
                    operation = "delete_dangling_consumers"
                ))
                .await;
            match cleanup {
                Ok(0) => info!("No dangling JetStream consumers found"),
                Ok(count) => info!(count, "Deleted dangling JetStream consumers"),
                Err(e) => warn!(error = %format!("{e:#}"), "JetStream consumer cleanup skipped"),
            }
            Arc::new(backend)
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        store,
        backend,
        cleaner,
        sink_validator,
        events,
        controller_config.clone(),
        &broker_config,
    ));

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        resync,
        controller_config,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = config.server_startup_timeout();
    let poll_interval = config.server_poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Consumer names the current Subscription specs map to
///
/// Derived from spec, not from status, so a type edited while the controller
/// was down does not keep its old consumer alive. A Subscription whose types
/// cannot be cleaned keeps whatever its status records.
pub async fn owned_consumer_names(
    cleaner: &EventTypeCleaner,
    subject_prefix: &str,
    subscriptions: &[Subscription],
) -> HashSet<String> {
    let mut owned = HashSet::new();
    for subscription in subscriptions {
        match desired_backend_types(cleaner, subject_prefix, subscription).await {
            Ok((_, types)) => owned.extend(types.into_iter().map(|t| t.consumer_name)),
            Err(e) => {
                warn!(
                    resource = %subscription.namespaced_name(),
                    error = %e,
                    "Event types cannot be cleaned, keeping consumers recorded in status"
                );
                owned.extend(
                    subscription
                        .status
                        .iter()
                        .filter_map(|s| s.backend.as_ref())
                        .flat_map(|b| b.types.iter().map(|t| t.consumer_name.clone())),
                );
            }
        }
    }
    owned
}

/// Remove JetStream consumers no current Subscription maps to
///
/// Covers Subscriptions deleted, or edited, while the controller was down.
///
/// # Errors
///
/// Listing Subscriptions or talking to the broker failed. The controller
/// still starts; reconciles clean up what they own.
pub async fn cleanup_dangling_consumers(
    backend: &JetStreamBackend,
    store: &dyn SubscriptionStore,
    cleaner: &EventTypeCleaner,
) -> Result<usize> {
    let subscriptions = store
        .list()
        .await
        .context("Could not list Subscriptions")?;
    let known = owned_consumer_names(cleaner, backend.subject_prefix(), &subscriptions).await;
    backend
        .delete_dangling_consumers(&known)
        .await
        .context("Failed to delete dangling JetStream consumers")
}
