//! Publisher
//!
//! Encodes a payload, merges headers and waits for the stream's
//! acknowledgement. A publish either returns a `PubAck` or fails; it is
//! never retried here. Callers that retry should set a message id so the
//! broker can drop duplicates.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::{translate, Boundary, JetStreamError, Result};
use crate::message::{header, Headers, Message};
use crate::transport::{subject, PubAck, TransportError};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A payload before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text
    Text(String),
    /// Raw bytes, sent as-is
    Binary(Bytes),
    /// A JSON document
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize any value into a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Binary(v.into())
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Payload::Json(v)
    }
}

/// Turns a payload into wire bytes
pub trait PayloadEncoder: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Bytes>;
}

/// UTF-8 text, binary passthrough, compact JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEncoder;

impl PayloadEncoder for DefaultEncoder {
    fn encode(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?.into()),
        }
    }
}

/// Per-publish options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Caller headers; override configured defaults per key
    pub headers: Headers,

    /// Ack timeout (defaults to the configured publish timeout)
    pub timeout: Option<Duration>,

    /// Deduplication id (`Nats-Msg-Id`)
    pub msg_id: Option<String>,

    /// Fail unless the subject is captured by this stream
    pub expected_stream: Option<String>,

    /// Fail unless the stream's last sequence is this value
    pub expected_last_sequence: Option<u64>,

    /// Fail unless the stream's last message id is this value
    pub expected_last_msg_id: Option<String>,
}

impl PublishOptions {
    /// Options with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a caller header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    /// Override the ack timeout for this publish
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the deduplication id
    pub fn msg_id(mut self, id: impl Into<String>) -> Self {
        self.msg_id = Some(id.into());
        self
    }

    /// Require the subject to land in `stream`
    pub fn expected_stream(mut self, stream: impl Into<String>) -> Self {
        self.expected_stream = Some(stream.into());
        self
    }

    /// Require the stream's last sequence to be `sequence`
    pub fn expected_last_sequence(mut self, sequence: u64) -> Self {
        self.expected_last_sequence = Some(sequence);
        self
    }

    /// Require the stream's last message id to be `id`
    pub fn expected_last_msg_id(mut self, id: impl Into<String>) -> Self {
        self.expected_last_msg_id = Some(id.into());
        self
    }
}

/// Publishes messages into streams
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    encoder: Arc<dyn PayloadEncoder>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Publisher {
    /// A publisher using the default payload encoder
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            encoder: Arc::new(DefaultEncoder),
        }
    }

    /// Replace the payload encoder
    pub fn with_encoder(mut self, encoder: Arc<dyn PayloadEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Publish and wait for the stream's acknowledgement
    ///
    /// A `None` payload is sent as an empty body. Fails with `Timeout` when
    /// no ack arrives in time; the message may still have been stored.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Option<Payload>,
        options: &PublishOptions,
    ) -> Result<PubAck> {
        subject::validate_publish_subject(subject).map_err(|reason| {
            JetStreamError::InvalidName {
                name: subject.to_string(),
                reason: reason.to_string(),
            }
        })?;
        let js = self.connection.jetstream().await?;

        let message = self.build_message(js.config(), subject, payload.as_ref(), options)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| js.config().publish_timeout());
        let size = message.payload.len();

        let ack = js
            .transport()
            .publish(message, timeout)
            .await
            .map_err(|e| match e {
                TransportError::TimedOut => JetStreamError::Timeout {
                    description: format!(
                        "publish to '{}' not acknowledged within {:?}",
                        subject, timeout
                    ),
                    raw_code: None,
                },
                e => translate(e, Boundary::Publish(subject)),
            })?;

        tracing::debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            size,
            "Message published"
        );
        Ok(ack)
    }

    /// Publish any serializable value as JSON
    pub async fn publish_json<T: Serialize>(
        &self,
        subject: &str,
        value: &T,
        options: &PublishOptions,
    ) -> Result<PubAck> {
        self.publish(subject, Some(Payload::json(value)?), options)
            .await
    }

    fn build_message(
        &self,
        config: &ClientConfig,
        subject: &str,
        payload: Option<&Payload>,
        options: &PublishOptions,
    ) -> Result<Message> {
        let body = match payload {
            Some(payload) => self.encoder.encode(payload)?,
            None => Bytes::new(),
        };

        let mut headers = config.default_headers.clone();
        headers.merge(&options.headers);
        if let Some(ref id) = options.msg_id {
            headers.insert(header::MSG_ID, id.as_str());
        }
        if let Some(ref stream) = options.expected_stream {
            headers.insert(header::EXPECTED_STREAM, stream.as_str());
        }
        if let Some(sequence) = options.expected_last_sequence {
            headers.insert(header::EXPECTED_LAST_SEQUENCE, sequence.to_string());
        }
        if let Some(ref id) = options.expected_last_msg_id {
            headers.insert(header::EXPECTED_LAST_MSG_ID, id.as_str());
        }

        Ok(Message {
            subject: subject.to_string(),
            payload: body,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamInfoOptions, StreamRegistry, StreamSpec};
    use crate::transport::codes;
    use crate::transport::memory::MemoryBroker;

    struct Shouting;

    impl PayloadEncoder for Shouting {
        fn encode(&self, payload: &Payload) -> Result<Bytes> {
            match payload {
                Payload::Text(text) => Ok(text.to_uppercase().into_bytes().into()),
                _ => Err(JetStreamError::Encode("text only".to_string())),
            }
        }
    }

    async fn setup(config: ClientConfig) -> (MemoryBroker, Arc<ConnectionManager>, Publisher) {
        let broker = MemoryBroker::new();
        let connection = Arc::new(ConnectionManager::new(config, Arc::new(broker.connector())));
        if connection.config().enable_jetstream {
            StreamRegistry::new(connection.clone())
                .create_or_update(&StreamSpec::new("ORDERS").subjects(["orders.*"]))
                .await
                .unwrap();
        }
        let publisher = Publisher::new(connection.clone());
        (broker, connection, publisher)
    }

    #[test]
    fn test_default_encoder() {
        let enc = DefaultEncoder;
        assert_eq!(&enc.encode(&"héllo".into()).unwrap()[..], "héllo".as_bytes());
        assert_eq!(
            &enc.encode(&vec![0u8, 159, 146].into()).unwrap()[..],
            &[0u8, 159, 146]
        );
        assert_eq!(
            &enc.encode(&serde_json::json!({"id": 1}).into()).unwrap()[..],
            br#"{"id":1}"#
        );
    }

    #[test]
    fn test_header_merge_order() {
        let mut config = ClientConfig::default();
        config.default_headers.insert("App", "billing");
        config.default_headers.insert("Nats-Msg-Id", "from-defaults");
        let connection = Arc::new(ConnectionManager::new(
            config.clone(),
            Arc::new(MemoryBroker::new().connector()),
        ));
        let publisher = Publisher::new(connection);

        let options = PublishOptions::new()
            .header("App", "orders")
            .header("Trace", "t1")
            .msg_id("m-1")
            .expected_last_sequence(7);
        let message = publisher
            .build_message(&config, "orders.created", None, &options)
            .unwrap();

        assert!(message.payload.is_empty());
        assert_eq!(message.headers.get("App"), Some("orders"));
        assert_eq!(message.headers.get("Trace"), Some("t1"));
        assert_eq!(message.headers.get(header::MSG_ID), Some("m-1"));
        assert_eq!(message.headers.get(header::EXPECTED_LAST_SEQUENCE), Some("7"));
        assert!(!message.headers.contains_key(header::EXPECTED_STREAM));
    }

    #[tokio::test]
    async fn test_empty_payload_gets_increasing_sequences() {
        let (_broker, connection, publisher) = setup(ClientConfig::default()).await;

        let mut last = 0;
        for _ in 0..5 {
            let ack = publisher
                .publish("orders.created", None, &PublishOptions::default())
                .await
                .unwrap();
            assert_eq!(ack.stream, "ORDERS");
            assert!(ack.sequence > last);
            last = ack.sequence;
        }

        let info = StreamRegistry::new(connection)
            .info("ORDERS", &StreamInfoOptions::default())
            .await
            .unwrap();
        assert_eq!(info.state.messages, 5);
    }

    #[tokio::test]
    async fn test_timeout_when_ack_is_late() {
        let (broker, _connection, publisher) = setup(ClientConfig::default()).await;
        broker.set_publish_delay(Some(Duration::from_millis(500)));

        let err = publisher
            .publish(
                "orders.created",
                Some("late".into()),
                &PublishOptions::new().timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JetStreamError::Timeout { .. }));
        assert!(err.to_string().contains("not acknowledged"));
    }

    #[tokio::test]
    async fn test_publish_waits_past_request_timeout() {
        let config = ClientConfig {
            request_timeout_secs: 1,
            publish_timeout_secs: 3,
            ..ClientConfig::default()
        };
        let (broker, _connection, publisher) = setup(config).await;
        broker.set_publish_delay(Some(Duration::from_millis(1500)));

        let ack = publisher
            .publish("orders.created", Some("slow".into()), &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(ack.stream, "ORDERS");
    }

    #[tokio::test]
    async fn test_dedup_and_expected_sequence() {
        let (_broker, _connection, publisher) = setup(ClientConfig::default()).await;

        let first = publisher
            .publish(
                "orders.created",
                Some("a".into()),
                &PublishOptions::new().msg_id("order-1"),
            )
            .await
            .unwrap();
        let again = publisher
            .publish(
                "orders.created",
                Some("a".into()),
                &PublishOptions::new().msg_id("order-1"),
            )
            .await
            .unwrap();
        assert!(again.duplicate);
        assert_eq!(again.sequence, first.sequence);

        let err = publisher
            .publish(
                "orders.paid",
                None,
                &PublishOptions::new().expected_last_sequence(first.sequence + 10),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.raw_code(), Some(codes::WRONG_LAST_SEQUENCE));

        publisher
            .publish(
                "orders.paid",
                None,
                &PublishOptions::new().expected_last_sequence(first.sequence),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subject_without_stream_is_not_found() {
        let (_broker, _connection, publisher) = setup(ClientConfig::default()).await;
        let err = publisher
            .publish("payments.created", None, &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_disabled_fails_without_network() {
        let config = ClientConfig {
            enable_jetstream: false,
            ..Default::default()
        };
        let (broker, _connection, publisher) = setup(config).await;

        let err = publisher
            .publish("orders.created", Some("x".into()), &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JetStreamError::CapabilityDisabled));
        assert_eq!(broker.request_count(), 0);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_custom_encoder() {
        let (_broker, _connection, publisher) = setup(ClientConfig::default()).await;
        let publisher = publisher.with_encoder(Arc::new(Shouting));

        publisher
            .publish("orders.created", Some("hi".into()), &PublishOptions::default())
            .await
            .unwrap();
        let err = publisher
            .publish(
                "orders.created",
                Some(Payload::Binary(Bytes::from_static(b"x"))),
                &PublishOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JetStreamError::Encode(_)));
    }

    #[tokio::test]
    async fn test_wildcard_subject_rejected() {
        let (_broker, _connection, publisher) = setup(ClientConfig::default()).await;
        let err = publisher
            .publish("orders.*", None, &PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JetStreamError::InvalidName { .. }));
    }
}
