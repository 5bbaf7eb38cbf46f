//! Stream configuration and state

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// How long messages are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep until a limit (age, count, size) is reached
    #[default]
    Limits,
    /// Keep while any consumer has not acknowledged
    Interest,
    /// Remove as soon as one consumer acknowledges
    WorkQueue,
}

/// Where messages are stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageType {
    /// Persistent file storage
    #[default]
    File,
    /// In-memory storage (lost on server restart)
    Memory,
}

/// What to do when a limit is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscardPolicy {
    /// Remove the oldest messages
    #[default]
    Old,
    /// Reject new messages
    New,
}

/// Stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Unique stream name
    pub name: String,

    /// Subjects captured by this stream (wildcards allowed)
    pub subjects: Vec<String>,

    pub description: Option<String>,

    pub retention: RetentionPolicy,

    /// Maximum number of consumers (-1 unlimited)
    pub max_consumers: i64,

    /// Maximum number of messages (-1 unlimited)
    pub max_msgs: i64,

    /// Maximum total bytes (-1 unlimited)
    pub max_bytes: i64,

    /// Maximum message age (zero means unlimited)
    pub max_age: Duration,

    /// Maximum size of a single message (-1 unlimited)
    pub max_msg_size: i64,

    pub storage: StorageType,

    pub discard: DiscardPolicy,

    /// Replication factor
    pub replicas: usize,

    /// Window for message-id deduplication (zero lets the server pick)
    pub duplicate_window: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            description: None,
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_msg_size: -1,
            storage: StorageType::File,
            discard: DiscardPolicy::Old,
            replicas: 1,
            duplicate_window: Duration::ZERO,
        }
    }
}

impl StreamConfig {
    /// A configuration with server defaults and no subjects
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Create-or-update input: a stream configuration plus the merge policy
///
/// `autoupdate` is local policy and never sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSpec {
    pub config: StreamConfig,

    /// On a "different configuration" conflict, retry as an update
    pub autoupdate: bool,
}

impl StreamSpec {
    /// A spec for `name` with default limits and `autoupdate` on
    pub fn new(name: impl Into<String>) -> Self {
        StreamConfig::new(name).into()
    }

    /// Subjects captured by the stream
    pub fn subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    /// Set the retention policy
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: StorageType) -> Self {
        self.config.storage = storage;
        self
    }

    /// Set the maximum message age
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age = max_age;
        self
    }

    /// Set the byte limit
    pub fn max_bytes(mut self, max_bytes: i64) -> Self {
        self.config.max_bytes = max_bytes;
        self
    }

    /// Set the message count limit
    pub fn max_msgs(mut self, max_msgs: i64) -> Self {
        self.config.max_msgs = max_msgs;
        self
    }

    /// Set the replication factor
    pub fn replicas(mut self, replicas: usize) -> Self {
        self.config.replicas = replicas;
        self
    }

    /// Set the discard policy
    pub fn discard(mut self, discard: DiscardPolicy) -> Self {
        self.config.discard = discard;
        self
    }

    /// Set the deduplication window
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.config.duplicate_window = window;
        self
    }

    /// Whether a configuration conflict retries as an update
    pub fn autoupdate(mut self, autoupdate: bool) -> Self {
        self.autoupdate = autoupdate;
        self
    }
}

impl From<StreamConfig> for StreamSpec {
    fn from(config: StreamConfig) -> Self {
        Self {
            config,
            autoupdate: true,
        }
    }
}

/// Partial stream update; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub subjects: Option<Vec<String>>,
    pub description: Option<String>,
    pub retention: Option<RetentionPolicy>,
    pub max_consumers: Option<i64>,
    pub max_msgs: Option<i64>,
    pub max_bytes: Option<i64>,
    pub max_age: Option<Duration>,
    pub max_msg_size: Option<i64>,
    pub discard: Option<DiscardPolicy>,
    pub replicas: Option<usize>,
    pub duplicate_window: Option<Duration>,
}

impl StreamUpdate {
    /// Apply this update on top of `config`
    pub fn apply(&self, mut config: StreamConfig) -> StreamConfig {
        if let Some(ref subjects) = self.subjects {
            config.subjects = subjects.clone();
        }
        if let Some(ref description) = self.description {
            config.description = Some(description.clone());
        }
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        if let Some(v) = self.max_consumers {
            config.max_consumers = v;
        }
        if let Some(v) = self.max_msgs {
            config.max_msgs = v;
        }
        if let Some(v) = self.max_bytes {
            config.max_bytes = v;
        }
        if let Some(v) = self.max_age {
            config.max_age = v;
        }
        if let Some(v) = self.max_msg_size {
            config.max_msg_size = v;
        }
        if let Some(v) = self.discard {
            config.discard = v;
        }
        if let Some(v) = self.replicas {
            config.replicas = v;
        }
        if let Some(v) = self.duplicate_window {
            config.duplicate_window = v;
        }
        config
    }

    /// Whether this update changes nothing
    pub fn is_empty(&self) -> bool {
        self == &StreamUpdate::default()
    }
}

impl From<&StreamConfig> for StreamUpdate {
    /// A full update carrying every modelled field of `config`
    fn from(config: &StreamConfig) -> Self {
        Self {
            subjects: Some(config.subjects.clone()),
            description: config.description.clone(),
            retention: Some(config.retention),
            max_consumers: Some(config.max_consumers),
            max_msgs: Some(config.max_msgs),
            max_bytes: Some(config.max_bytes),
            max_age: Some(config.max_age),
            max_msg_size: Some(config.max_msg_size),
            discard: Some(config.discard),
            replicas: Some(config.replicas),
            duplicate_window: Some(config.duplicate_window),
        }
    }
}

/// Options for a stream info request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfoOptions {
    /// Report per-subject message counts for subjects matching this filter
    pub subjects_filter: Option<String>,

    /// Report the sequences of deleted messages
    pub deleted_details: bool,
}

impl StreamInfoOptions {
    /// Whether no detail was requested
    pub fn is_empty(&self) -> bool {
        self.subjects_filter.is_none() && !self.deleted_details
    }
}

/// Runtime state of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    /// Messages currently stored
    pub messages: u64,

    /// Bytes currently stored
    pub bytes: u64,

    pub first_sequence: u64,

    pub first_timestamp: Option<DateTime<Utc>>,

    pub last_sequence: u64,

    pub last_timestamp: Option<DateTime<Utc>>,

    pub consumer_count: usize,

    pub num_subjects: u64,

    /// Per-subject counts, present when requested with `subjects_filter`
    pub subjects: Option<HashMap<String, u64>>,

    pub num_deleted: u64,

    /// Deleted sequences, present when requested with `deleted_details`
    pub deleted: Option<Vec<u64>>,
}

/// Stream configuration plus runtime state
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub config: StreamConfig,

    pub created: DateTime<Utc>,

    pub state: StreamState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_unlimited() {
        let config = StreamConfig::new("ORDERS");
        assert_eq!(config.name, "ORDERS");
        assert_eq!(config.max_msgs, -1);
        assert_eq!(config.max_bytes, -1);
        assert_eq!(config.max_consumers, -1);
        assert_eq!(config.max_msg_size, -1);
        assert_eq!(config.max_age, Duration::ZERO);
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.replicas, 1);
    }

    #[test]
    fn test_spec_builder_sets_fields() {
        let config = StreamSpec::new("ORDERS")
            .subjects(["orders.*"])
            .max_age(Duration::from_secs(60))
            .retention(RetentionPolicy::WorkQueue)
            .storage(StorageType::Memory)
            .replicas(3)
            .config;

        assert_eq!(config.subjects, vec!["orders.*".to_string()]);
        assert_eq!(config.retention, RetentionPolicy::WorkQueue);
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.replicas, 3);
        assert_eq!(config.max_age, Duration::from_secs(60));
        assert!(config.description.is_none());
    }

    #[test]
    fn test_spec_defaults_to_autoupdate() {
        let spec = StreamSpec::new("S");
        assert!(spec.autoupdate);
        assert!(!spec.autoupdate(false).autoupdate);
    }

    #[test]
    fn test_partial_update_keeps_unset_fields() {
        let base = StreamSpec::new("S")
            .subjects(["a.*"])
            .max_bytes(1024)
            .description("orders")
            .config;

        let update = StreamUpdate {
            max_age: Some(Duration::from_secs(5)),
            subjects: Some(vec!["a.*".to_string(), "b.*".to_string()]),
            ..Default::default()
        };
        let merged = update.apply(base.clone());

        assert_eq!(merged.subjects.len(), 2);
        assert_eq!(merged.max_age, Duration::from_secs(5));
        assert_eq!(merged.max_bytes, 1024);
        assert_eq!(merged.description.as_deref(), Some("orders"));
        assert!(StreamUpdate::default().is_empty());
        assert_eq!(StreamUpdate::from(&base).apply(StreamConfig::new("S")), base);
    }
}
