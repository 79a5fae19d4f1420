//! # Watch Loop
//!
//! Watches Subscriptions across all namespaces and drives reconciliation.
//! Connection-closed resyncs are merged into the same queue, so a resynced
//! object is never reconciled concurrently with a watch-triggered one.

use crate::controller::reconciler::{reconcile, Reconciler, ResyncTrigger};
use crate::controller::server::ServerState;
use crate::crd::Subscription;
use crate::runtime::error_policy::handle_reconciliation_error;
use futures::StreamExt;
use kube::api::Api;
use kube::Client;
use kube_runtime::{controller, watcher, Controller};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run the controller until a shutdown signal arrives
///
/// The watch is restarted after a delay whenever its stream ends.
///
/// # Errors
///
/// Currently always returns `Ok`; the signature leaves room for fatal watch errors.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    resync: ResyncTrigger,
) -> Result<(), anyhow::Error> {
    let subscriptions: Api<Subscription> = Api::all(client);
    let config = reconciler.controller_config.clone();

    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    loop {
        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::info_span!("controller.watch", operation = "watch_loop");
        let _watch_guard = watch_span.enter();

        info!(
            concurrency = config.max_concurrent_reconciliations,
            "Starting controller watch loop..."
        );
        Controller::new(
            subscriptions.clone(),
            watcher::Config::default().any_semantic(),
        )
        .with_config(
            controller::Config::default()
                .concurrency(config.max_concurrent_reconciliations),
        )
        .reconcile_on(resync.stream())
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, Arc::clone(&reconciler))
        .for_each(|result| {
            match result {
                Ok((object, action)) => {
                    debug!(resource = %object, action = ?action, "watch.event.reconciled");
                }
                Err(e) => {
                    warn!(error = %e, "watch.event.error");
                }
            }
            futures::future::ready(())
        })
        .await;

        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay = config.watch_restart_delay_after_end_duration();
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}
