//! Dead letter handling: messages that exhaust their delivery attempts
//!
//! The broker stops redelivering once `max_deliver` is reached, so the
//! final failure is the last chance to keep the message. A consume loop
//! with a `DeadLetterHandler` hands it over and terminates the delivery.

use crate::error::Result;
use crate::message::{JsMessage, Message};
use crate::transport::DeliveryInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed message with context about why it was dead-lettered
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The delivered message
    pub message: Message,

    /// Delivery metadata at the time of the final failure
    pub info: DeliveryInfo,

    /// Handler error that caused the final failure
    pub reason: String,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message: &JsMessage, reason: impl Into<String>) -> Self {
        Self {
            message: message.message().clone(),
            info: message.info().clone(),
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Receives messages whose processing failed on the final delivery attempt
///
/// Implementations may store, forward or alert on the message. An error
/// from `handle` leaves the delivery unterminated.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory dead letter store with a capacity bound
///
/// The oldest letters are dropped when the bound is exceeded.
pub struct MemoryDeadLetterHandler {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    capacity: usize,
}

impl MemoryDeadLetterHandler {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }
}

impl Default for MemoryDeadLetterHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetterHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            subject = %letter.message.subject,
            stream = %letter.info.stream,
            consumer = %letter.info.consumer,
            stream_sequence = letter.info.stream_sequence,
            delivered = letter.info.delivered,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.capacity > 0 && letters.len() > self.capacity {
            let excess = letters.len() - self.capacity;
            letters.drain(..excess);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether this delivery is the last one the consumer allows
///
/// `max_deliver` of zero or below means unlimited.
pub fn should_dead_letter(info: &DeliveryInfo, max_deliver: i64) -> bool {
    max_deliver > 0 && info.delivered >= max_deliver as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckKind, Acker, Delivery, TransportResult};

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self, _kind: AckKind) -> TransportResult<()> {
            Ok(())
        }
    }

    fn delivered(times: u64, sequence: u64) -> JsMessage {
        let info = DeliveryInfo {
            domain: None,
            stream: "ORDERS".to_string(),
            consumer: "c1".to_string(),
            delivered: times,
            stream_sequence: sequence,
            consumer_sequence: sequence,
            published: Utc::now(),
            pending: 0,
        };
        JsMessage::from(Delivery {
            message: Message::new("orders.created", "payload"),
            info,
            acker: Arc::new(NoopAcker),
        })
    }

    #[test]
    fn test_should_dead_letter() {
        assert!(!should_dead_letter(delivered(1, 1).info(), 5));
        assert!(!should_dead_letter(delivered(4, 1).info(), 5));
        assert!(should_dead_letter(delivered(5, 1).info(), 5));
        assert!(should_dead_letter(delivered(9, 1).info(), 5));
    }

    #[test]
    fn test_unlimited_never_dead_letters() {
        assert!(!should_dead_letter(delivered(100, 1).info(), -1));
        assert!(!should_dead_letter(delivered(100, 1).info(), 0));
    }

    #[tokio::test]
    async fn test_letter_keeps_message_and_info() {
        let letter = DeadLetter::new(&delivered(3, 42), "boom");
        assert_eq!(letter.reason, "boom");
        assert_eq!(letter.info.stream_sequence, 42);
        assert_eq!(&letter.message.payload[..], b"payload");
    }

    #[tokio::test]
    async fn test_memory_handler_lists_newest_first() {
        let dlq = MemoryDeadLetterHandler::default();
        for i in 0..5 {
            dlq.handle(DeadLetter::new(&delivered(3, i), format!("reason {}", i)))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 5);
        let list = dlq.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }

    #[tokio::test]
    async fn test_memory_handler_capacity() {
        let dlq = MemoryDeadLetterHandler::new(3);
        for i in 0..5 {
            dlq.handle(DeadLetter::new(&delivered(1, i), format!("reason {}", i)))
                .await
                .unwrap();
        }

        assert_eq!(dlq.count().await.unwrap(), 3);
        let list = dlq.list(10).await.unwrap();
        assert_eq!(list[0].reason, "reason 4");
        assert_eq!(list[2].reason, "reason 2");
    }
}
