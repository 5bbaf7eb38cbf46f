//! High-level client
//!
//! Wires one `ConnectionManager` into the registries, the publisher and
//! consume loops. Configuration is passed in; nothing is looked up from
//! a global container.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consume::{self, ConsumeHandle, ConsumeOptions, MessageHandler};
use crate::consumer::ConsumerRegistry;
use crate::error::Result;
use crate::publish::{Payload, PublishOptions, Publisher};
use crate::stream::StreamRegistry;
use crate::transport::memory::MemoryBroker;
use crate::transport::nats::NatsConnector;
use crate::transport::{Connector, PubAck};
use std::sync::Arc;

/// JetStream client
///
/// Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Arc<ConnectionManager>,
    streams: StreamRegistry,
    consumers: ConsumerRegistry,
    publisher: Publisher,
}

impl Client {
    /// Build a client over any connector; no connection is made until first use
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let connection = Arc::new(ConnectionManager::new(config, connector));
        Ok(Self {
            streams: StreamRegistry::new(connection.clone()),
            consumers: ConsumerRegistry::new(connection.clone()),
            publisher: Publisher::new(connection.clone()),
            connection,
        })
    }

    /// A client for a NATS server
    pub fn nats(config: ClientConfig) -> Result<Self> {
        Self::new(config, Arc::new(NatsConnector))
    }

    /// A client bound to an in-memory broker
    pub fn memory(broker: &MemoryBroker, config: ClientConfig) -> Result<Self> {
        Self::new(config, Arc::new(broker.connector()))
    }

    /// Connect to NATS now instead of on first use
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::nats(config)?;
        client.connection.session().await?;
        Ok(client)
    }

    /// Shared connection manager
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        self.connection.config()
    }

    /// Connection lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether the connection is established and currently up
    pub fn health(&self) -> bool {
        self.connection.health()
    }

    /// Stream management
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Consumer management
    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    /// Publisher sharing this client's connection
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Publish and wait for the stream's acknowledgement
    pub async fn publish(
        &self,
        subject: &str,
        payload: Option<Payload>,
        options: &PublishOptions,
    ) -> Result<PubAck> {
        self.publisher.publish(subject, payload, options).await
    }

    /// Start a consume loop on an existing consumer, or on a new ephemeral one when `consumer` is `None`
    pub async fn consume<H: MessageHandler>(
        &self,
        stream: &str,
        consumer: Option<&str>,
        options: ConsumeOptions,
        handler: H,
    ) -> Result<ConsumeHandle> {
        consume::consume(self.connection.clone(), stream, consumer, options, handler).await
    }
}
