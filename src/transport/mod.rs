//! Transport seam: the raw JetStream API surface
//!
//! A `Transport` speaks the JetStream management, publish and pull APIs
//! and reports failures untranslated (`TransportError`). Components above
//! this layer translate those failures exactly once at their boundary.
//!
//! Two transports ship with the crate:
//!
//! - **nats**: an `async_nats::jetstream::Context` on a live connection
//! - **memory**: an in-process broker with the same API semantics

use crate::config::ClientConfig;
use crate::consumer::{ConsumerConfig, ConsumerInfo};
use crate::message::Message;
use crate::stream::{StreamConfig, StreamInfo, StreamInfoOptions};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod ack;
pub mod memory;
pub mod nats;
pub mod subject;

pub use ack::{AckKind, Acker, Delivery, DeliveryInfo};

/// Result type for raw transport calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// JetStream API error codes this crate gives meaning to
///
/// These are the broker's `err_code` values. Anything not listed here is
/// carried through untouched inside `JetStreamError::Unknown`.
pub mod codes {
    /// Consumer name already in use
    pub const CONSUMER_NAME_EXISTS: u64 = 10013;
    /// Consumer not found
    pub const CONSUMER_NOT_FOUND: u64 = 10014;
    /// No message found
    pub const NO_MESSAGE_FOUND: u64 = 10037;
    /// JetStream not enabled for account
    pub const NOT_ENABLED_FOR_ACCOUNT: u64 = 10039;
    /// Stream configuration update can not change storage type
    pub const STREAM_STORAGE_CHANGE: u64 = 10052;
    /// Stream name already in use with a different configuration
    pub const STREAM_NAME_IN_USE: u64 = 10058;
    /// Stream not found
    pub const STREAM_NOT_FOUND: u64 = 10059;
    /// Expected stream does not match
    pub const STREAM_NOT_MATCH: u64 = 10060;
    /// Subjects overlap with an existing stream
    pub const STREAM_SUBJECT_OVERLAP: u64 = 10065;
    /// Wrong last msg ID
    pub const WRONG_LAST_MSG_ID: u64 = 10070;
    /// Wrong last sequence
    pub const WRONG_LAST_SEQUENCE: u64 = 10071;
    /// JetStream not enabled
    pub const NOT_ENABLED: u64 = 10076;
    /// Consumer already exists with a different configuration
    pub const CONSUMER_ALREADY_EXISTS: u64 = 10148;
    /// Consumer does not exist (update action)
    pub const CONSUMER_DOES_NOT_EXIST: u64 = 10149;
    /// Consumer configuration field can not be updated
    pub const CONSUMER_CREATE: u64 = 10012;
}

/// Error body returned by the JetStream API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-like status (400, 404, 408, 500, 503)
    pub code: u16,

    /// JetStream-specific error code
    pub err_code: u64,

    /// Human-readable description
    pub description: String,
}

impl ApiError {
    /// An API error with the given status, `err_code` and description
    pub fn new(code: u16, err_code: u64, description: impl Into<String>) -> Self {
        Self {
            code,
            err_code,
            description: description.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (status {}, err_code {})",
            self.description, self.code, self.err_code
        )
    }
}

/// Untranslated transport failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The broker answered with an API error
    #[error("JetStream API error: {0}")]
    Api(ApiError),

    /// No reply arrived within the request timeout
    #[error("request timed out")]
    TimedOut,

    /// Nobody is listening on the request subject
    #[error("no responders")]
    NoResponders,

    /// The underlying connection is down
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Any other I/O or client failure
    #[error("transport failure: {0}")]
    Io(String),

    /// A reply could not be decoded
    #[error("malformed reply: {0}")]
    Decode(String),
}

/// What a consumer create request is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerAction {
    /// Fail if a consumer with a different configuration exists
    Create,
    /// Fail if the consumer does not exist
    Update,
    /// Create, or return/replace the existing consumer
    CreateOrUpdate,
}

/// A single pull request against a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Maximum number of messages to return
    pub batch: usize,

    /// How long the broker keeps the request open
    pub expires: Option<Duration>,

    /// Return immediately when nothing is available
    pub no_wait: bool,
}

impl PullRequest {
    /// A waiting pull for up to `batch` messages
    pub fn new(batch: usize, expires: Duration) -> Self {
        Self {
            batch: batch.max(1),
            expires: Some(expires),
            no_wait: false,
        }
    }
}

/// Broker receipt for a persisted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    /// Stream the message was stored in
    pub stream: String,

    /// Sequence assigned by the stream
    pub sequence: u64,

    /// True when the message id was already seen inside the duplicate window
    pub duplicate: bool,

    /// JetStream domain, when the broker runs in one
    pub domain: Option<String>,
}

/// Account-level JetStream usage, returned by the capability check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    /// Memory storage in use (bytes)
    pub memory: u64,

    /// File storage in use (bytes)
    pub storage: u64,

    /// Number of streams
    pub streams: usize,

    /// Number of consumers
    pub consumers: usize,

    /// JetStream domain
    pub domain: Option<String>,
}

/// Core trait for JetStream transports
///
/// One method per JetStream API call. Implementations must be safe to
/// share between tasks: every call is an independent request over the
/// same multiplexed connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the underlying connection is currently up
    fn is_connected(&self) -> bool;

    /// Account info, used as the capability check
    async fn account_info(&self) -> TransportResult<AccountInfo>;

    /// Create a stream
    async fn create_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo>;

    /// Replace a stream's configuration
    async fn update_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo>;

    /// Delete a stream and its consumers
    async fn delete_stream(&self, name: &str) -> TransportResult<()>;

    /// Purge messages from a stream, optionally only those on a subject
    async fn purge_stream(&self, name: &str, subject: Option<&str>) -> TransportResult<u64>;

    /// Current configuration and state of a stream
    async fn stream_info(
        &self,
        name: &str,
        options: &StreamInfoOptions,
    ) -> TransportResult<StreamInfo>;

    /// Names of all streams
    async fn stream_names(&self) -> TransportResult<Vec<String>>;

    /// Create or update a consumer, depending on `action`
    async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo>;

    /// Delete a consumer
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()>;

    /// Current position and counters of a consumer
    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo>;

    /// Names of all consumers on a stream
    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>>;

    /// Publish a message and wait up to `timeout` for the stream's acknowledgement
    ///
    /// Fails with `TimedOut` once `timeout` passes without an ack.
    async fn publish(&self, message: Message, timeout: Duration) -> TransportResult<PubAck>;

    /// Issue one pull request and collect what it yields
    ///
    /// An empty vector means the request expired without messages.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        request: &PullRequest,
    ) -> TransportResult<Vec<Delivery>>;
}

/// Factory for transports
///
/// The connection manager calls `connect` once per successful handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a transport for the given configuration
    async fn connect(&self, config: &ClientConfig) -> TransportResult<Arc<dyn Transport>>;
}
