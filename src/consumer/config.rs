//! Consumer configuration and state

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default time the broker waits for an ack before redelivering
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default cap on unacknowledged messages
pub const DEFAULT_MAX_ACK_PENDING: i64 = 1000;

/// Where a new consumer starts reading from the stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Deliver all available messages
    #[default]
    All,
    /// Deliver starting from the last message
    Last,
    /// Deliver only new messages published after creation
    New,
    /// Deliver starting from a specific stream sequence
    ByStartSequence {
        start_sequence: u64,
    },
    /// Deliver starting from the first message stored at or after a time
    ByStartTime {
        start_time: DateTime<Utc>,
    },
    /// Deliver the last message of every subject
    LastPerSubject,
}

/// How deliveries must be acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// No acks; delivered means done
    None,
    /// Acking a message acks every earlier one too
    All,
    /// Every message is acked individually
    #[default]
    Explicit,
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Durable name; `None` creates an ephemeral consumer
    pub durable_name: Option<String>,

    /// Consumer name (server-assigned for ephemerals)
    pub name: Option<String>,

    pub description: Option<String>,

    /// Starting position
    pub deliver_policy: DeliverPolicy,

    pub ack_policy: AckPolicy,

    /// Time to wait for an ack before redelivery
    pub ack_wait: Duration,

    /// Maximum delivery attempts (-1 unlimited)
    pub max_deliver: i64,

    /// Only deliver messages on subjects matching this filter
    pub filter_subject: Option<String>,

    /// Maximum unacknowledged messages in flight (-1 unlimited)
    pub max_ack_pending: i64,

    /// Redelivery backoff schedule
    pub backoff: Vec<Duration>,

    /// Idle time after which the server removes the consumer (zero keeps durables forever)
    pub inactive_threshold: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            name: None,
            description: None,
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::Explicit,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: -1,
            filter_subject: None,
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
            backoff: Vec::new(),
            inactive_threshold: Duration::ZERO,
        }
    }
}

impl ConsumerConfig {
    /// A durable consumer with default policies
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// An ephemeral consumer with default policies
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Set the starting position
    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    /// Set the acknowledgement policy
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Only deliver messages on subjects matching `subject`
    pub fn filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    /// Set the time the broker waits for an ack
    pub fn ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = wait;
        self
    }

    /// Set the maximum number of delivery attempts
    pub fn max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    /// Set the cap on unacknowledged messages
    pub fn max_ack_pending(mut self, max: i64) -> Self {
        self.max_ack_pending = max;
        self
    }

    /// Set the redelivery backoff schedule
    pub fn backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Name the consumer is addressed by (`name` falls back to `durable_name`)
    pub fn consumer_name(&self) -> Option<&str> {
        self.name.as_deref().or(self.durable_name.as_deref())
    }
}

/// Partial consumer update; `None` fields keep their current value
///
/// Only fields the broker allows to change after creation are offered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerUpdate {
    pub description: Option<String>,
    pub ack_wait: Option<Duration>,
    pub max_deliver: Option<i64>,
    pub filter_subject: Option<String>,
    pub max_ack_pending: Option<i64>,
    pub backoff: Option<Vec<Duration>>,
    pub inactive_threshold: Option<Duration>,
}

impl ConsumerUpdate {
    /// Apply this update on top of `config`
    pub fn apply(&self, mut config: ConsumerConfig) -> ConsumerConfig {
        if let Some(ref description) = self.description {
            config.description = Some(description.clone());
        }
        if let Some(v) = self.ack_wait {
            config.ack_wait = v;
        }
        if let Some(v) = self.max_deliver {
            config.max_deliver = v;
        }
        if let Some(ref subject) = self.filter_subject {
            config.filter_subject = Some(subject.clone()).filter(|s| !s.is_empty());
        }
        if let Some(v) = self.max_ack_pending {
            config.max_ack_pending = v;
        }
        if let Some(ref backoff) = self.backoff {
            config.backoff = backoff.clone();
        }
        if let Some(v) = self.inactive_threshold {
            config.inactive_threshold = v;
        }
        config
    }
}

/// A consumer/stream sequence pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceInfo {
    pub consumer_sequence: u64,

    pub stream_sequence: u64,

    pub last_active: Option<DateTime<Utc>>,
}

/// Consumer configuration plus cursor state
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    /// Owning stream
    pub stream_name: String,

    /// Consumer name
    pub name: String,

    pub created: DateTime<Utc>,

    pub config: ConsumerConfig,

    /// Last delivered position
    pub delivered: SequenceInfo,

    /// Highest contiguously acknowledged position
    pub ack_floor: SequenceInfo,

    /// Delivered but not yet acknowledged
    pub num_ack_pending: usize,

    /// Messages delivered more than once
    pub num_redelivered: usize,

    /// Pull requests waiting
    pub num_waiting: usize,

    /// Matching messages not yet delivered
    pub num_pending: u64,
}

impl ConsumerInfo {
    /// First stream sequence this consumer will (or did) deliver
    pub fn start_sequence(&self) -> u64 {
        self.delivered.stream_sequence + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_defaults() {
        let config = ConsumerConfig::durable("c1");
        assert_eq!(config.durable_name.as_deref(), Some("c1"));
        assert_eq!(config.deliver_policy, DeliverPolicy::All);
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.ack_wait, DEFAULT_ACK_WAIT);
        assert_eq!(config.max_deliver, -1);
        assert_eq!(config.max_ack_pending, DEFAULT_MAX_ACK_PENDING);
        assert!(config.filter_subject.is_none());
    }

    #[test]
    fn test_update_clears_filter_with_empty_subject() {
        let base = ConsumerConfig::durable("c1").filter_subject("orders.*");
        let updated = ConsumerUpdate {
            filter_subject: Some(String::new()),
            ..Default::default()
        }
        .apply(base);
        assert!(updated.filter_subject.is_none());
    }

    #[test]
    fn test_update_merges_only_set_fields() {
        let base = ConsumerConfig::durable("c1")
            .filter_subject("orders.*")
            .max_deliver(5);
        let updated = ConsumerUpdate {
            max_ack_pending: Some(50),
            ..Default::default()
        }
        .apply(base.clone());

        assert_eq!(updated.max_ack_pending, 50);
        assert_eq!(updated.max_deliver, 5);
        assert_eq!(updated.filter_subject.as_deref(), Some("orders.*"));
        assert_eq!(updated.durable_name, base.durable_name);
    }

    #[test]
    fn test_consumer_name_prefers_name() {
        let mut config = ConsumerConfig::durable("durable");
        assert_eq!(config.consumer_name(), Some("durable"));
        config.name = Some("named".to_string());
        assert_eq!(config.consumer_name(), Some("named"));
        assert_eq!(ConsumerConfig::ephemeral().consumer_name(), None);
    }
}
