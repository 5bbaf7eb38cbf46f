//! Conversions between `async_nats::jetstream` types and crate types

use crate::consumer::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, SequenceInfo};
use crate::message::{Headers, Message};
use crate::stream::{
    DiscardPolicy, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};
use crate::transport::{codes, AccountInfo, ApiError, DeliveryInfo, PubAck, TransportError};
use async_nats::jetstream::consumer::{self, pull};
use async_nats::jetstream::context::{
    AccountErrorKind, CreateStreamErrorKind, GetStreamErrorKind, PublishErrorKind,
    RequestErrorKind,
};
use async_nats::jetstream::stream::{
    self, ConsumerCreateStrictErrorKind, ConsumerErrorKind, ConsumerUpdateErrorKind,
    PurgeErrorKind,
};
use async_nats::jetstream::{self as js, account::Account, publish::PublishAck};
use async_nats::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use time::OffsetDateTime;

/// How an async-nats error kind maps onto `TransportError`
pub(super) enum Class {
    Api(ApiError),
    TimedOut,
    NoResponders,
    /// Look further down the source chain
    Other,
}

pub(super) trait Classify {
    fn classify(&self) -> Class;
}

impl Classify for RequestErrorKind {
    fn classify(&self) -> Class {
        match self {
            RequestErrorKind::TimedOut => Class::TimedOut,
            RequestErrorKind::NoResponders => Class::NoResponders,
            RequestErrorKind::Other => Class::Other,
        }
    }
}

impl Classify for AccountErrorKind {
    fn classify(&self) -> Class {
        match self {
            AccountErrorKind::JetStream(err) => Class::Api(api_error(err)),
            AccountErrorKind::TimedOut => Class::TimedOut,
            AccountErrorKind::JetStreamUnavailable => Class::NoResponders,
            AccountErrorKind::Other => Class::Other,
        }
    }
}

impl Classify for CreateStreamErrorKind {
    fn classify(&self) -> Class {
        match self {
            CreateStreamErrorKind::JetStream(err) => Class::Api(api_error(err)),
            CreateStreamErrorKind::TimedOut => Class::TimedOut,
            CreateStreamErrorKind::JetStreamUnavailable => Class::NoResponders,
            _ => Class::Other,
        }
    }
}

impl Classify for GetStreamErrorKind {
    fn classify(&self) -> Class {
        match self {
            GetStreamErrorKind::JetStream(err) => Class::Api(api_error(err)),
            _ => Class::Other,
        }
    }
}

impl Classify for PurgeErrorKind {
    fn classify(&self) -> Class {
        match self {
            PurgeErrorKind::JetStream(err) => Class::Api(api_error(err)),
            PurgeErrorKind::TimedOut => Class::TimedOut,
            PurgeErrorKind::Request => Class::Other,
        }
    }
}

impl Classify for ConsumerErrorKind {
    fn classify(&self) -> Class {
        match self {
            ConsumerErrorKind::JetStream(err) => Class::Api(api_error(err)),
            ConsumerErrorKind::TimedOut => Class::TimedOut,
            _ => Class::Other,
        }
    }
}

impl Classify for ConsumerCreateStrictErrorKind {
    fn classify(&self) -> Class {
        match self {
            ConsumerCreateStrictErrorKind::JetStream(err) => Class::Api(api_error(err)),
            ConsumerCreateStrictErrorKind::AlreadyExists => Class::Api(ApiError::new(
                400,
                codes::CONSUMER_ALREADY_EXISTS,
                "consumer already exists",
            )),
            ConsumerCreateStrictErrorKind::TimedOut => Class::TimedOut,
            _ => Class::Other,
        }
    }
}

impl Classify for ConsumerUpdateErrorKind {
    fn classify(&self) -> Class {
        match self {
            ConsumerUpdateErrorKind::JetStream(err) => Class::Api(api_error(err)),
            ConsumerUpdateErrorKind::DoesNotExist => Class::Api(ApiError::new(
                404,
                codes::CONSUMER_DOES_NOT_EXIST,
                "consumer does not exist",
            )),
            ConsumerUpdateErrorKind::TimedOut => Class::TimedOut,
            _ => Class::Other,
        }
    }
}

impl Classify for PublishErrorKind {
    fn classify(&self) -> Class {
        match self {
            PublishErrorKind::StreamNotFound => Class::NoResponders,
            PublishErrorKind::TimedOut => Class::TimedOut,
            _ => Class::Other,
        }
    }
}

/// Map an async-nats error onto `TransportError`, keeping JetStream error codes
pub(super) fn transport_error<K>(err: async_nats::error::Error<K>) -> TransportError
where
    K: Classify + Clone + Debug + Display + PartialEq + 'static,
{
    match err.kind().classify() {
        Class::Api(api) => TransportError::Api(api),
        Class::TimedOut => TransportError::TimedOut,
        Class::NoResponders => TransportError::NoResponders,
        Class::Other => from_source_chain(&err),
    }
}

fn from_source_chain(err: &(dyn StdError + 'static)) -> TransportError {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(api) = cause.downcast_ref::<js::Error>() {
            return TransportError::Api(api_error(api));
        }
        if let Some(request) = cause.downcast_ref::<js::context::RequestError>() {
            match request.kind().classify() {
                Class::Other => {}
                Class::Api(api) => return TransportError::Api(api),
                Class::TimedOut => return TransportError::TimedOut,
                Class::NoResponders => return TransportError::NoResponders,
            }
        }
        if let Some(request) = cause.downcast_ref::<async_nats::RequestError>() {
            match request.kind() {
                async_nats::RequestErrorKind::TimedOut => return TransportError::TimedOut,
                async_nats::RequestErrorKind::NoResponders => {
                    return TransportError::NoResponders
                }
                async_nats::RequestErrorKind::Other => {}
            }
        }
        source = cause.source();
    }
    TransportError::Io(err.to_string())
}

/// Error carried by a failed pull batch (a non-OK status from the server)
pub(super) fn batch_error(err: async_nats::Error) -> TransportError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("deleted") {
        TransportError::Api(ApiError::new(409, codes::CONSUMER_NOT_FOUND, text))
    } else if lower.contains("503") || lower.contains("no responders") {
        TransportError::NoResponders
    } else {
        TransportError::Io(text)
    }
}

/// The status, `err_code` and description of a JetStream API error
pub(super) fn api_error(err: &js::Error) -> ApiError {
    let body = serde_json::to_value(err).unwrap_or(Value::Null);
    let err_code = body.get("err_code").and_then(Value::as_u64).unwrap_or(0);
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    ApiError::new(
        u16::try_from(err.code()).unwrap_or(500),
        err_code,
        description,
    )
}

pub(super) fn to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_default()
}

/// `None` for the zero timestamp the server reports on empty streams
fn to_chrono_opt(t: OffsetDateTime) -> Option<DateTime<Utc>> {
    (t.unix_timestamp() > 0).then(|| to_chrono(t))
}

fn to_offset(t: &DateTime<Utc>) -> OffsetDateTime {
    t.timestamp_nanos_opt()
        .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(nanos.into()).ok())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn clamp_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { -1 } else { i32::MAX })
}

/// Write the fields this crate models onto `base`, leaving every other field as is
pub(super) fn overlay_stream(mut base: stream::Config, config: &StreamConfig) -> stream::Config {
    base.name = config.name.clone();
    base.subjects = config.subjects.clone();
    base.description = config.description.clone();
    base.retention = match config.retention {
        RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
        RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
        RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
    };
    base.max_consumers = clamp_i32(config.max_consumers);
    base.max_messages = config.max_msgs;
    base.max_bytes = config.max_bytes;
    base.max_age = config.max_age;
    base.max_message_size = clamp_i32(config.max_msg_size);
    base.storage = match config.storage {
        StorageType::File => stream::StorageType::File,
        StorageType::Memory => stream::StorageType::Memory,
    };
    base.discard = match config.discard {
        DiscardPolicy::Old => stream::DiscardPolicy::Old,
        DiscardPolicy::New => stream::DiscardPolicy::New,
    };
    base.num_replicas = config.replicas;
    base.duplicate_window = config.duplicate_window;
    base
}

pub(super) fn from_stream_config(config: &stream::Config) -> StreamConfig {
    StreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        description: config.description.clone(),
        retention: match config.retention {
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        },
        max_consumers: config.max_consumers.into(),
        max_msgs: config.max_messages,
        max_bytes: config.max_bytes,
        max_age: config.max_age,
        max_msg_size: config.max_message_size.into(),
        storage: match config.storage {
            stream::StorageType::File => StorageType::File,
            stream::StorageType::Memory => StorageType::Memory,
        },
        discard: match config.discard {
            stream::DiscardPolicy::Old => DiscardPolicy::Old,
            stream::DiscardPolicy::New => DiscardPolicy::New,
        },
        replicas: config.num_replicas,
        duplicate_window: config.duplicate_window,
    }
}

pub(super) fn from_stream_info(info: &stream::Info) -> StreamInfo {
    let state = &info.state;
    StreamInfo {
        config: from_stream_config(&info.config),
        created: to_chrono(info.created),
        state: StreamState {
            messages: state.messages,
            bytes: state.bytes,
            first_sequence: state.first_sequence,
            first_timestamp: to_chrono_opt(state.first_timestamp),
            last_sequence: state.last_sequence,
            last_timestamp: to_chrono_opt(state.last_timestamp),
            consumer_count: state.consumer_count,
            num_subjects: state.subjects_count,
            subjects: None,
            num_deleted: state.deleted_count.unwrap_or(0),
            deleted: state.deleted.clone(),
        },
    }
}

/// Write the fields this crate models onto `base`, leaving every other field as is
pub(super) fn overlay_consumer(
    mut base: consumer::Config,
    config: &ConsumerConfig,
) -> consumer::Config {
    base.durable_name = config.durable_name.clone();
    base.name = config.name.clone();
    base.description = config.description.clone();
    base.deliver_policy = match &config.deliver_policy {
        DeliverPolicy::All => consumer::DeliverPolicy::All,
        DeliverPolicy::Last => consumer::DeliverPolicy::Last,
        DeliverPolicy::New => consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { start_sequence } => {
            consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *start_sequence,
            }
        }
        DeliverPolicy::ByStartTime { start_time } => consumer::DeliverPolicy::ByStartTime {
            start_time: to_offset(start_time),
        },
        DeliverPolicy::LastPerSubject => consumer::DeliverPolicy::LastPerSubject,
    };
    base.ack_policy = match config.ack_policy {
        AckPolicy::None => consumer::AckPolicy::None,
        AckPolicy::All => consumer::AckPolicy::All,
        AckPolicy::Explicit => consumer::AckPolicy::Explicit,
    };
    base.ack_wait = config.ack_wait;
    base.max_deliver = config.max_deliver;
    base.filter_subject = config.filter_subject.clone().unwrap_or_default();
    base.max_ack_pending = config.max_ack_pending;
    base.backoff = config.backoff.clone();
    base.inactive_threshold = config.inactive_threshold;
    base
}

pub(super) fn from_consumer_config(config: &consumer::Config) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: config.durable_name.clone(),
        name: config.name.clone(),
        description: config.description.clone(),
        deliver_policy: match &config.deliver_policy {
            consumer::DeliverPolicy::All => DeliverPolicy::All,
            consumer::DeliverPolicy::Last => DeliverPolicy::Last,
            consumer::DeliverPolicy::New => DeliverPolicy::New,
            consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
                DeliverPolicy::ByStartSequence {
                    start_sequence: *start_sequence,
                }
            }
            consumer::DeliverPolicy::ByStartTime { start_time } => DeliverPolicy::ByStartTime {
                start_time: to_chrono(*start_time),
            },
            consumer::DeliverPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
        },
        ack_policy: match config.ack_policy {
            consumer::AckPolicy::None => AckPolicy::None,
            consumer::AckPolicy::All => AckPolicy::All,
            consumer::AckPolicy::Explicit => AckPolicy::Explicit,
        },
        ack_wait: config.ack_wait,
        max_deliver: config.max_deliver,
        filter_subject: Some(config.filter_subject.clone()).filter(|s| !s.is_empty()),
        max_ack_pending: config.max_ack_pending,
        backoff: config.backoff.clone(),
        inactive_threshold: config.inactive_threshold,
    }
}

fn from_sequence_info(info: &consumer::SequenceInfo) -> SequenceInfo {
    SequenceInfo {
        consumer_sequence: info.consumer_sequence,
        stream_sequence: info.stream_sequence,
        last_active: info.last_active.map(to_chrono),
    }
}

pub(super) fn from_consumer_info(info: &consumer::Info) -> ConsumerInfo {
    ConsumerInfo {
        stream_name: info.stream_name.clone(),
        name: info.name.clone(),
        created: to_chrono(info.created),
        config: from_consumer_config(&info.config),
        delivered: from_sequence_info(&info.delivered),
        ack_floor: from_sequence_info(&info.ack_floor),
        num_ack_pending: info.num_ack_pending,
        num_redelivered: info.num_redelivered,
        num_waiting: info.num_waiting,
        num_pending: info.num_pending,
    }
}

/// A pull consumer handle for fetching from an existing consumer of any shape
pub(super) type PullConsumer = consumer::Consumer<pull::Config>;

pub(super) fn from_account(account: Account) -> AccountInfo {
    AccountInfo {
        memory: account.memory,
        storage: account.storage,
        streams: account.streams,
        consumers: account.consumers,
        domain: account.domain,
    }
}

pub(super) fn from_publish_ack(ack: PublishAck) -> PubAck {
    PubAck {
        stream: ack.stream,
        sequence: ack.sequence,
        duplicate: ack.duplicate,
        domain: Some(ack.domain).filter(|d| !d.is_empty()),
    }
}

pub(super) fn from_message_info(info: &js::message::Info<'_>) -> DeliveryInfo {
    DeliveryInfo {
        domain: info.domain.filter(|d| !d.is_empty()).map(str::to_string),
        stream: info.stream.to_string(),
        consumer: info.consumer.to_string(),
        delivered: u64::try_from(info.delivered).unwrap_or(1),
        stream_sequence: info.stream_sequence,
        consumer_sequence: info.consumer_sequence,
        published: to_chrono(info.published),
        pending: info.pending,
    }
}

pub(super) fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, values) in headers.iter() {
        for value in values {
            map.append(key, value.as_str());
        }
    }
    map
}

pub(super) fn from_header_map(map: Option<&HeaderMap>) -> Headers {
    let mut headers = Headers::new();
    if let Some(map) = map {
        for (key, values) in map.iter() {
            for value in values {
                headers.append(key.to_string(), value.to_string());
            }
        }
    }
    headers
}

pub(super) fn from_nats(message: async_nats::Message) -> Message {
    Message {
        subject: message.subject.to_string(),
        headers: from_header_map(message.headers.as_ref()),
        payload: message.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn jetstream_error(json: &str) -> js::Error {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_api_error_keeps_codes() {
        let err =
            jetstream_error(r#"{"code":404,"err_code":10059,"description":"stream not found"}"#);
        let api = api_error(&err);
        assert_eq!(api.code, 404);
        assert_eq!(api.err_code, codes::STREAM_NOT_FOUND);
        assert_eq!(api.description, "stream not found");
    }

    #[test]
    fn test_api_error_without_description() {
        let api = api_error(&jetstream_error(r#"{"code":503,"err_code":10039}"#));
        assert_eq!(api.code, 503);
        assert_eq!(api.err_code, codes::NOT_ENABLED_FOR_ACCOUNT);
        assert!(!api.description.is_empty());
    }

    #[test]
    fn test_strict_create_conflict_maps_to_already_exists() {
        match ConsumerCreateStrictErrorKind::AlreadyExists.classify() {
            Class::Api(api) => assert_eq!(api.err_code, codes::CONSUMER_ALREADY_EXISTS),
            _ => panic!("expected an API error"),
        }
    }

    #[test]
    fn test_consumer_overlay_keeps_unmodelled_fields() {
        let mut metadata = HashMap::new();
        metadata.insert("owner".to_string(), "billing".to_string());
        let current = consumer::Config {
            durable_name: Some("c1".to_string()),
            headers_only: true,
            max_waiting: 16,
            rate_limit: 1024,
            metadata,
            ..Default::default()
        };

        let ours = from_consumer_config(&current).max_ack_pending(7);
        let updated = overlay_consumer(current.clone(), &ours);

        assert_eq!(updated.max_ack_pending, 7);
        assert!(updated.headers_only);
        assert_eq!(updated.max_waiting, 16);
        assert_eq!(updated.rate_limit, 1024);
        assert_eq!(updated.metadata.get("owner").map(String::as_str), Some("billing"));
    }

    #[test]
    fn test_stream_overlay_keeps_unmodelled_fields() {
        let current = stream::Config {
            name: "ORDERS".to_string(),
            subjects: vec!["orders.*".to_string()],
            allow_rollup: true,
            deny_delete: true,
            max_messages_per_subject: 10,
            ..Default::default()
        };

        let mut ours = from_stream_config(&current);
        ours.max_age = Duration::from_secs(60);
        let updated = overlay_stream(current, &ours);

        assert_eq!(updated.max_age, Duration::from_secs(60));
        assert!(updated.allow_rollup);
        assert!(updated.deny_delete);
        assert_eq!(updated.max_messages_per_subject, 10);
    }

    #[test]
    fn test_deliver_policy_survives_conversion() {
        let start_time = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        for policy in [
            DeliverPolicy::New,
            DeliverPolicy::ByStartSequence { start_sequence: 42 },
            DeliverPolicy::ByStartTime { start_time },
        ] {
            let config = ConsumerConfig::durable("c1").deliver_policy(policy.clone());
            let nats = overlay_consumer(consumer::Config::default(), &config);
            assert_eq!(from_consumer_config(&nats).deliver_policy, policy);
        }
    }

    #[test]
    fn test_empty_filter_subject_is_none() {
        let config = from_consumer_config(&consumer::Config::default());
        assert!(config.filter_subject.is_none());
    }

    #[test]
    fn test_zero_timestamp_is_none() {
        assert!(to_chrono_opt(OffsetDateTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_deleted_consumer_status_is_not_found() {
        let err: async_nats::Error = Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "error while processing messages from the stream: 409, Some(\"Consumer Deleted\")",
        ));
        match batch_error(err) {
            TransportError::Api(api) => assert_eq!(api.err_code, codes::CONSUMER_NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_headers_convert_both_ways() {
        let headers: Headers = [("Nats-Msg-Id", "m1"), ("X-Tag", "a"), ("X-Tag", "b")]
            .into_iter()
            .collect();
        let map = to_header_map(&headers);
        assert_eq!(
            map.get("Nats-Msg-Id").map(|v| v.to_string()),
            Some("m1".to_string())
        );

        let back = from_header_map(Some(&map));
        assert_eq!(back.get("Nats-Msg-Id"), Some("m1"));
        assert_eq!(back.get_all("X-Tag").len(), 2);
        assert!(from_header_map(None).is_empty());
    }
}
