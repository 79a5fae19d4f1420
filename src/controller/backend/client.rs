//! # async-nats Adapters
//!
//! Production implementations of the connector/client traits. This is the only
//! file that touches `async-nats` types; every error is flattened into a
//! [`BackendError`] carrying the operation name.

use super::jetstream::{ConsumerInfo, ConsumerSettings, JetStreamClient, JetStreamConnector};
use super::nats_core::{CoreClient, CoreConnector, CoreSubscription};
use super::{BackendError, ConnectionClosedHandler};
use crate::config::{
    BrokerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy, StorageType, StreamSettings,
};
use crate::constants::{CONTROLLER_NAME, JS_CONSUMER_ACK_WAIT_SECS, JS_CONSUMER_MAX_DELIVER};
use async_nats::connection::State;
use async_nats::jetstream::context::ConsumerInfoErrorKind;
use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Whether `event` means the client has stopped reconnecting
///
/// Running out of reconnect attempts is reported as a client error, not as
/// `Closed`; `Closed` only follows an explicit close.
fn connection_lost_for_good(event: &async_nats::Event) -> bool {
    matches!(
        event,
        async_nats::Event::Closed
            | async_nats::Event::ClientError(async_nats::ClientError::MaxReconnects)
    )
}

async fn connect(
    config: &BrokerConfig,
    on_closed: ConnectionClosedHandler,
) -> Result<async_nats::Client, BackendError> {
    let reconnect_wait = config.reconnect_wait;

    async_nats::ConnectOptions::new()
        .name(CONTROLLER_NAME)
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(move |event| {
            let on_closed = Arc::clone(&on_closed);
            async move {
                if connection_lost_for_good(&event) {
                    error!(event = %event, "NATS connection closed, reconnect attempts exhausted");
                    // The handler future is not Sync, so it runs on its own task
                    tokio::spawn(on_closed());
                    return;
                }
                match event {
                    async_nats::Event::Disconnected => warn!("NATS connection lost, reconnecting"),
                    async_nats::Event::Connected => info!("NATS connection established"),
                    other => debug!(event = %other, "NATS client event"),
                }
            }
        })
        .connect(config.url.as_str())
        .await
        .map_err(|e| BackendError::Connect {
            url: config.url.clone(),
            message: e.to_string(),
        })
}

/// Connects plain NATS clients
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

#[async_trait]
impl CoreConnector for NatsConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn CoreClient>, BackendError> {
        let client = connect(config, on_closed).await?;
        Ok(Arc::new(NatsCoreClient { client }))
    }
}

#[derive(Debug)]
struct NatsCoreClient {
    client: async_nats::Client,
}

#[async_trait]
impl CoreClient for NatsCoreClient {
    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn CoreSubscription>, BackendError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| BackendError::broker("queue_subscribe", e))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }
}

#[derive(Debug)]
struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl CoreSubscription for NatsSubscription {
    async fn unsubscribe(mut self: Box<Self>) -> Result<(), BackendError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| BackendError::broker("unsubscribe", e))
    }
}

/// Connects JetStream contexts bound to the configured stream
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsJetStreamConnector;

#[async_trait]
impl JetStreamConnector for NatsJetStreamConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
        on_closed: ConnectionClosedHandler,
    ) -> Result<Arc<dyn JetStreamClient>, BackendError> {
        let client = connect(config, on_closed).await?;
        Ok(Arc::new(NatsJetStreamClient {
            context: jetstream::new(client.clone()),
            client,
            stream_name: config.stream.name.clone(),
        }))
    }
}

struct NatsJetStreamClient {
    client: async_nats::Client,
    context: jetstream::Context,
    stream_name: String,
}

impl std::fmt::Debug for NatsJetStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsJetStreamClient")
            .field("stream_name", &self.stream_name)
            .finish_non_exhaustive()
    }
}

impl NatsJetStreamClient {
    async fn stream(&self) -> Result<stream::Stream, BackendError> {
        self.context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BackendError::broker("get_stream", e))
    }

    fn pull_config(settings: &ConsumerSettings) -> consumer::pull::Config {
        consumer::pull::Config {
            durable_name: Some(settings.name.clone()),
            name: Some(settings.name.clone()),
            description: Some(settings.description.clone()),
            filter_subject: settings.filter_subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(JS_CONSUMER_ACK_WAIT_SECS),
            max_deliver: JS_CONSUMER_MAX_DELIVER,
            max_ack_pending: settings.max_ack_pending,
            deliver_policy: deliver_policy(settings.deliver_policy),
            ..Default::default()
        }
    }

}

fn stream_config(settings: &StreamSettings) -> stream::Config {
    stream::Config {
        name: settings.name.clone(),
        subjects: settings.subjects(),
        storage: match settings.storage {
            StorageType::Memory => stream::StorageType::Memory,
            StorageType::File => stream::StorageType::File,
        },
        retention: match settings.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
        },
        discard: match settings.discard {
            DiscardPolicy::New => stream::DiscardPolicy::New,
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
        },
        max_messages: settings.max_messages,
        max_bytes: settings.max_bytes,
        ..Default::default()
    }
}

fn deliver_policy(policy: DeliverPolicy) -> consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::All => consumer::DeliverPolicy::All,
        DeliverPolicy::Last => consumer::DeliverPolicy::Last,
        DeliverPolicy::LastPerSubject => consumer::DeliverPolicy::LastPerSubject,
        DeliverPolicy::New => consumer::DeliverPolicy::New,
    }
}

fn stream_drifted(current: &stream::Config, desired: &stream::Config) -> bool {
    current.subjects != desired.subjects
        || current.storage != desired.storage
        || current.retention != desired.retention
        || current.discard != desired.discard
        || current.max_messages != desired.max_messages
        || current.max_bytes != desired.max_bytes
}

#[async_trait]
impl JetStreamClient for NatsJetStreamClient {
    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn ensure_stream(&self, settings: &StreamSettings) -> Result<(), BackendError> {
        let desired = stream_config(settings);
        let stream = self
            .context
            .get_or_create_stream(desired.clone())
            .await
            .map_err(|e| BackendError::broker("create_stream", e))?;

        if stream_drifted(&stream.cached_info().config, &desired) {
            info!(stream = %settings.name, "Updating JetStream stream configuration");
            self.context
                .update_stream(&desired)
                .await
                .map_err(|e| BackendError::broker("update_stream", e))?;
        }
        Ok(())
    }

    async fn consumer_names(&self) -> Result<Vec<String>, BackendError> {
        self.stream()
            .await?
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| BackendError::broker("consumer_names", e))
    }

    async fn consumer_info(&self, name: &str) -> Result<Option<ConsumerInfo>, BackendError> {
        match self.stream().await?.consumer_info(name).await {
            Ok(info) => Ok(Some(ConsumerInfo {
                name: info.name,
                filter_subject: info.config.filter_subject,
                max_ack_pending: info.config.max_ack_pending,
            })),
            Err(e) if matches!(e.kind(), ConsumerInfoErrorKind::NotFound) => Ok(None),
            Err(e) => Err(BackendError::broker("consumer_info", e)),
        }
    }

    async fn create_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError> {
        self.stream()
            .await?
            .create_consumer(Self::pull_config(settings))
            .await
            .map(|_| ())
            .map_err(|e| BackendError::broker("create_consumer", e))
    }

    async fn update_consumer(&self, settings: &ConsumerSettings) -> Result<(), BackendError> {
        self.stream()
            .await?
            .update_consumer(Self::pull_config(settings))
            .await
            .map(|_| ())
            .map_err(|e| BackendError::broker("update_consumer", e))
    }

    async fn delete_consumer(&self, name: &str) -> Result<bool, BackendError> {
        match self.stream().await?.delete_consumer(name).await {
            Ok(_) => Ok(true),
            Err(e) if consumer_not_found(&e.kind()) => Ok(false),
            Err(e) => Err(BackendError::broker("delete_consumer", e)),
        }
    }
}

fn consumer_not_found(kind: &stream::ConsumerErrorKind) -> bool {
    matches!(
        kind,
        stream::ConsumerErrorKind::JetStream(err)
            if err.error_code() == jetstream::ErrorCode::CONSUMER_NOT_FOUND
    )
}
