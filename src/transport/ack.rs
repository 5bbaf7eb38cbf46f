//! Deliveries and their acknowledgement handles
//!
//! A pull fetch hands out `Delivery` values: the message, the metadata the
//! broker attached to it, and an `Acker` bound to that one delivery.

use crate::message::Message;
use crate::transport::TransportResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Metadata the broker attaches to a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// JetStream domain (`None` for the default domain)
    pub domain: Option<String>,
    /// Stream the message came from
    pub stream: String,
    /// Consumer that delivered it
    pub consumer: String,
    /// Number of times this message has been delivered
    pub delivered: u64,
    /// Sequence in the stream
    pub stream_sequence: u64,
    /// Sequence in the consumer
    pub consumer_sequence: u64,
    /// When the message was stored
    pub published: DateTime<Utc>,
    /// Messages still pending for the consumer after this one
    pub pending: u64,
}

/// Acknowledgement kinds understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing succeeded
    Ack,
    /// Processing failed; redeliver, optionally after a delay
    Nak(Option<Duration>),
    /// Still working; reset the ack wait timer
    Progress,
    /// Never redeliver
    Term,
}

/// Settles one delivery
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, kind: AckKind) -> TransportResult<()>;
}

/// A message handed out by a pull fetch
#[derive(Clone)]
pub struct Delivery {
    pub message: Message,
    pub info: DeliveryInfo,
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("info", &self.info)
            .finish()
    }
}
