//! # a3s-jetstream
//!
//! Durable stream, consumer, publish and consume core for NATS JetStream.
//!
//! ## Overview
//!
//! `a3s-jetstream` manages streams and consumers, publishes with
//! acknowledgement and timeout semantics, and runs cancellable consume
//! loops with bounded concurrency. Broker failures are translated into a
//! small, stable error taxonomy that keeps the broker's original codes.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_jetstream::{Client, ClientConfig, ConsumerConfig, DeliverPolicy, PublishOptions, StreamSpec};
//! use a3s_jetstream::transport::memory::MemoryBroker;
//!
//! # async fn example() -> a3s_jetstream::Result<()> {
//! let broker = MemoryBroker::new();
//! let client = Client::memory(&broker, ClientConfig::default())?;
//!
//! client
//!     .streams()
//!     .create_or_update(&StreamSpec::new("ORDERS").subjects(["orders.*"]))
//!     .await?;
//!
//! client
//!     .consumers()
//!     .create("ORDERS", &ConsumerConfig::durable("c1").deliver_policy(DeliverPolicy::New))
//!     .await?;
//!
//! let ack = client
//!     .publish("orders.created", Some(r#"{"id":1}"#.into()), &PublishOptions::default())
//!     .await?;
//! println!("stored as {} in {}", ack.sequence, ack.stream);
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **nats**: an `async_nats::jetstream::Context` on a live connection
//! - **memory**: in-process broker for tests and single-process use
//!
//! ## Architecture
//!
//! - **ConnectionManager**: one lazily established session, one handshake
//! - **StreamRegistry** / **ConsumerRegistry**: management calls, no local cache
//! - **Publisher**: payload encoding, header merge, ack timeout
//! - **consume**: pull loop with a semaphore-bounded handler pool
//! - **error::translate**: raw transport failures to `JetStreamError`

pub mod client;
pub mod config;
pub mod connection;
pub mod consume;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod message;
pub mod publish;
pub mod stream;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, JetStream};
pub use consume::{ConsumeHandle, ConsumeOptions, ConsumeStats, HandlerError, MessageHandler};
pub use consumer::{
    AckPolicy, ConsumerConfig, ConsumerInfo, ConsumerRegistry, ConsumerUpdate, DeliverPolicy,
};
pub use dlq::{DeadLetter, DeadLetterHandler, MemoryDeadLetterHandler};
pub use error::{JetStreamError, Result};
pub use message::{Headers, JsMessage, Message};
pub use publish::{DefaultEncoder, Payload, PayloadEncoder, PublishOptions, Publisher};
pub use stream::{
    DiscardPolicy, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamInfoOptions,
    StreamRegistry, StreamSpec, StreamUpdate,
};
pub use transport::{AckKind, Acker, Delivery, DeliveryInfo, PubAck, Transport, TransportError};
