//! NATS transport
//!
//! Wraps an `async_nats::jetstream::Context`. Crate types are mapped to and
//! from `async_nats::jetstream` types in `convert`, and nowhere else.

mod convert;

use crate::config::ClientConfig;
use crate::consumer::{ConsumerConfig, ConsumerInfo};
use crate::message::Message;
use crate::stream::{StreamConfig, StreamInfo, StreamInfoOptions};
use crate::transport::{
    AccountInfo, AckKind, Acker, ConsumerAction, Connector, Delivery, PubAck, PullRequest,
    Transport, TransportError, TransportResult,
};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer, context::Publish};
use async_trait::async_trait;
use convert::{
    batch_error, from_account, from_consumer_info, from_message_info,
    from_nats, from_publish_ack, from_stream_info, overlay_consumer, overlay_stream,
    to_header_map, transport_error, PullConsumer,
};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Transport over a live NATS connection
#[derive(Clone)]
pub struct NatsTransport {
    client: async_nats::Client,
    context: jetstream::Context,
    request_timeout: Duration,
}

impl NatsTransport {
    /// Wrap a connected client, honouring the configured domain or API prefix
    pub fn new(client: async_nats::Client, config: &ClientConfig) -> Self {
        let mut context = jetstream::with_prefix(client.clone(), &config.api_prefix());
        context.set_timeout(config.request_timeout());
        Self {
            client,
            context,
            request_timeout: config.request_timeout(),
        }
    }

    /// The underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// The JetStream context every call goes through
    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    async fn stream(&self, name: &str) -> TransportResult<jetstream::stream::Stream> {
        self.context.get_stream(name).await.map_err(transport_error)
    }

    async fn nats_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> TransportResult<consumer::Consumer<consumer::Config>> {
        self.context
            .get_consumer_from_stream(consumer, stream)
            .await
            .map_err(transport_error)
    }
}

/// Settles one delivery through the message's own reply subject
struct NatsAcker(jetstream::message::Acker);

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self, kind: AckKind) -> TransportResult<()> {
        let kind = match kind {
            AckKind::Ack => jetstream::AckKind::Ack,
            AckKind::Nak(delay) => jetstream::AckKind::Nak(delay),
            AckKind::Progress => jetstream::AckKind::Progress,
            AckKind::Term => jetstream::AckKind::Term,
        };
        self.0
            .ack_with(kind)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn account_info(&self) -> TransportResult<AccountInfo> {
        let account = self.context.query_account().await.map_err(transport_error)?;
        Ok(from_account(account))
    }

    async fn create_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo> {
        let stream = self
            .context
            .create_stream(overlay_stream(Default::default(), config))
            .await
            .map_err(transport_error)?;
        Ok(from_stream_info(stream.cached_info()))
    }

    async fn update_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo> {
        let current = self.stream(&config.name).await?;
        let merged = overlay_stream(current.cached_info().config.clone(), config);
        let info = self
            .context
            .update_stream(&merged)
            .await
            .map_err(transport_error)?;
        Ok(from_stream_info(&info))
    }

    async fn delete_stream(&self, name: &str) -> TransportResult<()> {
        let status = self
            .context
            .delete_stream(name)
            .await
            .map_err(transport_error)?;
        if !status.success {
            return Err(TransportError::Decode(format!(
                "stream delete of '{}' reported no success",
                name
            )));
        }
        Ok(())
    }

    async fn purge_stream(&self, name: &str, subject: Option<&str>) -> TransportResult<u64> {
        let stream = self.stream(name).await?;
        let response = match subject {
            Some(subject) => stream.purge().filter(subject).await,
            None => stream.purge().await,
        }
        .map_err(transport_error)?;
        Ok(response.purged)
    }

    async fn stream_info(
        &self,
        name: &str,
        options: &StreamInfoOptions,
    ) -> TransportResult<StreamInfo> {
        let stream = self.stream(name).await?;
        if options.is_empty() {
            return Ok(from_stream_info(stream.cached_info()));
        }

        let mut builder = stream.info_builder().with_deleted(options.deleted_details);
        if let Some(ref filter) = options.subjects_filter {
            builder = builder.subjects(filter.as_str());
        }
        let detailed = builder.fetch().await.map_err(transport_error)?;
        let mut info = from_stream_info(&detailed.info);
        if options.subjects_filter.is_some() {
            let mut counts = std::pin::pin!(detailed);
            let mut subjects = HashMap::new();
            while let Some((subject, count)) = counts.try_next().await.map_err(transport_error)? {
                subjects.insert(subject, count as u64);
            }
            info.state.subjects = Some(subjects);
        }
        Ok(info)
    }

    async fn stream_names(&self) -> TransportResult<Vec<String>> {
        self.context
            .stream_names()
            .map_err(transport_error)
            .try_collect()
            .await
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo> {
        let created = match action {
            ConsumerAction::Create => self
                .context
                .create_consumer_strict_on_stream(
                    overlay_consumer(Default::default(), config),
                    stream,
                )
                .await
                .map_err(transport_error)?,
            ConsumerAction::CreateOrUpdate => self
                .context
                .create_consumer_on_stream(overlay_consumer(Default::default(), config), stream)
                .await
                .map_err(transport_error)?,
            ConsumerAction::Update => {
                let name = config.consumer_name().unwrap_or_default();
                let current = self.nats_consumer(stream, name).await?;
                let merged = overlay_consumer(current.cached_info().config.clone(), config);
                self.context
                    .update_consumer_on_stream(merged, stream)
                    .await
                    .map_err(transport_error)?
            }
        };
        Ok(from_consumer_info(created.cached_info()))
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()> {
        let status = self
            .context
            .delete_consumer_from_stream(consumer, stream)
            .await
            .map_err(transport_error)?;
        if !status.success {
            return Err(TransportError::Decode(format!(
                "consumer delete of '{}' reported no success",
                consumer
            )));
        }
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo> {
        let consumer = self.nats_consumer(stream, consumer).await?;
        Ok(from_consumer_info(consumer.cached_info()))
    }

    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>> {
        self.stream(stream)
            .await?
            .consumer_names()
            .map_err(transport_error)
            .try_collect()
            .await
    }

    async fn publish(&self, message: Message, timeout: Duration) -> TransportResult<PubAck> {
        let mut context = self.context.clone();
        context.set_timeout(timeout);

        let mut publish = Publish::build().payload(message.payload);
        if !message.headers.is_empty() {
            publish = publish.headers(to_header_map(&message.headers));
        }
        let ack = context
            .send_publish(message.subject, publish)
            .await
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;
        Ok(from_publish_ack(ack))
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        request: &PullRequest,
    ) -> TransportResult<Vec<Delivery>> {
        let pull: PullConsumer = self
            .context
            .get_consumer_from_stream(consumer, stream)
            .await
            .map_err(transport_error)?;

        let batch = if request.no_wait {
            pull.fetch()
                .max_messages(request.batch)
                .messages()
                .await
        } else {
            pull.batch()
                .max_messages(request.batch)
                .expires(request.expires.unwrap_or(self.request_timeout))
                .messages()
                .await
        }
        .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut batch = std::pin::pin!(batch);
        let mut deliveries = Vec::with_capacity(request.batch);
        while let Some(next) = batch.next().await {
            let message = match next {
                Ok(message) => message,
                Err(e) => {
                    let err = batch_error(e);
                    if matches!(err, TransportError::Io(_)) {
                        tracing::debug!(consumer, error = %err, "Pull request ended");
                        break;
                    }
                    return Err(err);
                }
            };
            let info = match message.info() {
                Ok(info) => from_message_info(&info),
                Err(e) => {
                    tracing::warn!(consumer, error = %e, "Skipping message without delivery metadata");
                    continue;
                }
            };
            let (message, acker) = message.split();
            deliveries.push(Delivery {
                message: from_nats(message),
                info,
                acker: Arc::new(NatsAcker(acker)),
            });
        }
        Ok(deliveries)
    }
}

/// Connector that dials a NATS server
#[derive(Debug, Clone, Default)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, config: &ClientConfig) -> TransportResult<Arc<dyn Transport>> {
        let options = build_connect_options(config);
        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| TransportError::Disconnected(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        Ok(Arc::new(NatsTransport::new(client, config)))
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &ClientConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(config.connect_timeout())
        .request_timeout(Some(config.request_timeout()));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }
    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        opts = opts.user_and_password(user.clone(), password.clone());
    }
    if let Some(ref name) = config.name {
        opts = opts.name(name.as_str());
    }

    opts
}
