//! Messages and headers
//!
//! A `Message` is what travels over the transport in both directions.
//! Delivered messages arrive as `JsMessage`, which pairs the message with
//! its delivery metadata and the handle that acknowledges it.

use crate::error::{translate, Boundary, Result};
use crate::transport::{AckKind, Acker, Delivery, DeliveryInfo};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Message header names with JetStream meaning
pub mod header {
    pub const MSG_ID: &str = "Nats-Msg-Id";
    pub const EXPECTED_STREAM: &str = "Nats-Expected-Stream";
    pub const EXPECTED_LAST_SEQUENCE: &str = "Nats-Expected-Last-Sequence";
    pub const EXPECTED_LAST_MSG_ID: &str = "Nats-Expected-Last-Msg-Id";
}

/// Header map: each key holds an ordered list of values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    /// An empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key` with a single value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Add a value after any existing values of `key`
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// First value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// All values of `key`, in insertion order
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove `key` and return its values
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    /// Whether `key` has at least one value
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Whether no header is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Keys with their values, in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Overlay `other` onto this map; keys present in `other` replace ours
    pub fn merge(&mut self, other: &Headers) {
        for (key, values) in &other.0 {
            self.0.insert(key.clone(), values.clone());
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

/// A message on a subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to
    pub subject: String,

    /// Raw payload bytes
    pub payload: Bytes,

    /// Header map
    pub headers: Headers,
}

impl Message {
    /// A message without headers
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Append a header value
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }
}

/// A message delivered by a consumer, with ack controls
///
/// The ack methods borrow the handle and can be called more than once.
/// The broker settles a delivery on the first `ack` or `term`; later
/// acknowledgements for the same delivery are ignored by the broker.
/// Clones share the same delivery.
#[derive(Clone)]
pub struct JsMessage {
    message: Message,
    info: DeliveryInfo,
    acker: Arc<dyn Acker>,
}

impl fmt::Debug for JsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsMessage")
            .field("message", &self.message)
            .field("info", &self.info)
            .finish()
    }
}

impl From<Delivery> for JsMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            message: delivery.message,
            info: delivery.info,
            acker: delivery.acker,
        }
    }
}

impl JsMessage {
    /// Subject the message was published to
    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Headers set by the publisher
    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    /// Delivery metadata (sequences, delivery count, pending)
    pub fn info(&self) -> &DeliveryInfo {
        &self.info
    }

    /// The delivered message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Give up the ack handle and keep the message
    pub fn into_message(self) -> Message {
        self.message
    }

    /// Acknowledge successful processing
    pub async fn ack(&self) -> Result<()> {
        self.send(AckKind::Ack).await
    }

    /// Negative-acknowledge (request redelivery)
    pub async fn nak(&self) -> Result<()> {
        self.send(AckKind::Nak(None)).await
    }

    /// Negative-acknowledge with a redelivery delay
    pub async fn nak_with_delay(&self, delay: Duration) -> Result<()> {
        self.send(AckKind::Nak(Some(delay))).await
    }

    /// Signal that processing is still in progress
    pub async fn in_progress(&self) -> Result<()> {
        self.send(AckKind::Progress).await
    }

    /// Stop redelivery of this message
    pub async fn term(&self) -> Result<()> {
        self.send(AckKind::Term).await
    }

    async fn send(&self, kind: AckKind) -> Result<()> {
        self.acker
            .ack(kind)
            .await
            .map_err(|e| translate(e, Boundary::Ack(&self.message.subject)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_keep_value_order() {
        let mut headers = Headers::new();
        headers.append("X-Trace", "a");
        headers.append("X-Trace", "b");
        headers.insert("Content-Type", "text/plain");

        assert_eq!(headers.get("X-Trace"), Some("a"));
        assert_eq!(headers.get_all("X-Trace"), &["a".to_string(), "b".to_string()]);
        assert_eq!(headers.len(), 2);
        assert!(headers.get_all("missing").is_empty());
    }

    #[test]
    fn test_headers_merge_overrides_per_key() {
        let mut defaults: Headers = [("App", "billing"), ("Env", "prod")].into_iter().collect();
        let caller: Headers = [("Env", "staging"), ("Env", "eu")].into_iter().collect();
        defaults.merge(&caller);

        assert_eq!(defaults.get("App"), Some("billing"));
        assert_eq!(defaults.get_all("Env"), &["staging".to_string(), "eu".to_string()]);
    }

    #[test]
    fn test_headers_serialize_as_map_of_lists() {
        let headers: Headers = [("k", "v1"), ("k", "v2")].into_iter().collect();
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"{"k":["v1","v2"]}"#);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("orders.created", "hi").with_header("a", "1");
        assert_eq!(msg.subject, "orders.created");
        assert_eq!(&msg.payload[..], b"hi");
        assert_eq!(msg.headers.get("a"), Some("1"));
    }

    struct RecordingAcker(std::sync::Mutex<Vec<AckKind>>);

    #[async_trait::async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self, kind: AckKind) -> crate::transport::TransportResult<()> {
            self.0.lock().unwrap().push(kind);
            Ok(())
        }
    }

    fn delivered(acker: Arc<RecordingAcker>) -> JsMessage {
        JsMessage::from(Delivery {
            message: Message::new("orders.created", "hi"),
            info: DeliveryInfo {
                domain: None,
                stream: "ORDERS".to_string(),
                consumer: "c1".to_string(),
                delivered: 1,
                stream_sequence: 7,
                consumer_sequence: 1,
                published: chrono::Utc::now(),
                pending: 0,
            },
            acker,
        })
    }

    #[tokio::test]
    async fn test_ack_leaves_handle_usable() {
        let acker = Arc::new(RecordingAcker(Default::default()));
        let msg = delivered(acker.clone());

        msg.in_progress().await.unwrap();
        msg.ack().await.unwrap();
        msg.ack().await.unwrap();
        msg.clone().term().await.unwrap();

        assert_eq!(msg.info().stream_sequence, 7);
        assert_eq!(msg.subject(), "orders.created");
        assert_eq!(
            *acker.0.lock().unwrap(),
            vec![AckKind::Progress, AckKind::Ack, AckKind::Ack, AckKind::Term]
        );
    }

    #[tokio::test]
    async fn test_nak_with_delay_passes_delay() {
        let acker = Arc::new(RecordingAcker(Default::default()));
        let msg = delivered(acker.clone());
        msg.nak_with_delay(Duration::from_millis(250)).await.unwrap();
        msg.nak().await.unwrap();
        assert_eq!(
            *acker.0.lock().unwrap(),
            vec![
                AckKind::Nak(Some(Duration::from_millis(250))),
                AckKind::Nak(None)
            ]
        );
    }
}
