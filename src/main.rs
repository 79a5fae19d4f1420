//! # Eventing Controller
//!
//! Watches `Subscription` resources in all namespaces and keeps one broker
//! consumer per subscribed event type, on plain NATS or on JetStream.
//!
//! Configuration comes from environment variables; see `config/`.

use eventing_controller::runtime::initialization::initialize;
use eventing_controller::runtime::watch_loop::run_watch_loop;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let init = initialize().await?;

    run_watch_loop(
        init.client,
        init.reconciler,
        init.server_state,
        init.resync,
    )
    .await?;

    info!("Eventing controller exited");
    Ok(())
}
