//! Broker state for the memory transport
//!
//! Plain synchronous data structures; the async transport wraps them in a
//! mutex and never holds the lock across an await.

use crate::consumer::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, SequenceInfo};
use crate::message::{header, Headers, Message};
use crate::stream::{
    DiscardPolicy, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamInfoOptions, StreamState,
};
use crate::transport::ack::{AckKind, DeliveryInfo};
use crate::transport::subject;
use crate::transport::{codes, ApiError, ConsumerAction, PubAck, TransportError, TransportResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Server default for the deduplication window
const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

const MAX_REPLICAS: usize = 5;

fn api(code: u16, err_code: u64, description: impl Into<String>) -> TransportError {
    TransportError::Api(ApiError::new(code, err_code, description))
}

fn stream_not_found() -> TransportError {
    api(404, codes::STREAM_NOT_FOUND, "stream not found")
}

fn consumer_not_found() -> TransportError {
    api(404, codes::CONSUMER_NOT_FOUND, "consumer not found")
}

/// Cap for deadlines that would overflow the clock
const FAR_FUTURE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn to_chrono(duration: Duration) -> Option<chrono::Duration> {
    chrono::Duration::from_std(duration).ok()
}

fn deadline_after(instant: Instant, wait: Duration) -> Instant {
    instant
        .checked_add(wait)
        .unwrap_or_else(|| instant + FAR_FUTURE)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    headers: Headers,
    payload: Bytes,
    time: DateTime<Utc>,
}

impl StoredMessage {
    fn size(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(k, vs)| vs.iter().map(|v| k.len() + v.len() + 4).sum::<usize>())
            .sum();
        (self.subject.len() + self.payload.len() + header_bytes) as u64
    }
}

#[derive(Debug, Clone)]
struct Pending {
    consumer_sequence: u64,
    deliveries: u64,
    deadline: Instant,
}

#[derive(Debug)]
struct ConsumerEntry {
    name: String,
    config: ConsumerConfig,
    created: DateTime<Utc>,
    /// Next stream sequence to examine for first delivery
    next_sequence: u64,
    delivered: SequenceInfo,
    ack_floor: SequenceInfo,
    pending: BTreeMap<u64, Pending>,
    /// Last-per-subject snapshot: sequences up to `.0` are delivered only if in `.1`
    last_per_subject: Option<(u64, HashSet<u64>)>,
}

impl ConsumerEntry {
    fn wants(&self, sequence: u64, message: &StoredMessage) -> bool {
        if let Some(ref filter) = self.config.filter_subject {
            if !subject::matches(filter, &message.subject) {
                return false;
            }
        }
        match self.last_per_subject {
            Some((upto, ref keep)) if sequence <= upto => keep.contains(&sequence),
            _ => true,
        }
    }

    fn tracks_acks(&self) -> bool {
        self.config.ack_policy != AckPolicy::None
    }

    fn redelivery_wait(&self, deliveries: u64) -> Duration {
        let index = deliveries.saturating_sub(1) as usize;
        match self.config.backoff.get(index).or(self.config.backoff.last()) {
            Some(wait) => *wait,
            None => self.config.ack_wait,
        }
    }

    fn exhausted(&self, deliveries: u64) -> bool {
        self.config.max_deliver > 0 && deliveries >= self.config.max_deliver as u64
    }

    fn refresh_ack_floor(&mut self) {
        match self.pending.iter().next() {
            Some((sequence, pending)) => {
                self.ack_floor.stream_sequence = sequence - 1;
                self.ack_floor.consumer_sequence = pending.consumer_sequence - 1;
            }
            None => {
                self.ack_floor.stream_sequence = self.delivered.stream_sequence;
                self.ack_floor.consumer_sequence = self.delivered.consumer_sequence;
            }
        }
    }
}

#[derive(Debug)]
struct StreamEntry {
    config: StreamConfig,
    created: DateTime<Utc>,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    bytes: u64,
    dedup: HashMap<String, (u64, DateTime<Utc>)>,
    last_msg_id: Option<String>,
    consumers: BTreeMap<String, ConsumerEntry>,
}

impl StreamEntry {
    fn new(config: StreamConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            created: now,
            messages: BTreeMap::new(),
            last_sequence: 0,
            last_timestamp: None,
            bytes: 0,
            dedup: HashMap::new(),
            last_msg_id: None,
            consumers: BTreeMap::new(),
        }
    }

    fn first_sequence(&self) -> u64 {
        match self.messages.keys().next() {
            Some(seq) => *seq,
            None if self.last_sequence == 0 => 0,
            None => self.last_sequence + 1,
        }
    }

    fn remove(&mut self, sequence: u64) -> bool {
        match self.messages.remove(&sequence) {
            Some(message) => {
                self.bytes = self.bytes.saturating_sub(message.size());
                true
            }
            None => false,
        }
    }

    fn remove_oldest(&mut self) {
        if let Some(sequence) = self.messages.keys().next().copied() {
            self.remove(sequence);
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = to_chrono(self.config.max_age).and_then(|age| now.checked_sub_signed(age));
        if let (false, Some(cutoff)) = (self.config.max_age.is_zero(), cutoff) {
            let expired: Vec<u64> = self
                .messages
                .iter()
                .take_while(|(_, m)| m.time < cutoff)
                .map(|(seq, _)| *seq)
                .collect();
            for sequence in expired {
                self.remove(sequence);
            }
        }

        let window = to_chrono(self.config.duplicate_window);
        self.dedup.retain(|_, (_, at)| {
            match window.and_then(|w| at.checked_add_signed(w)) {
                Some(expiry) => expiry > now,
                None => true,
            }
        });
    }

    fn enforce_limits(&mut self) {
        if self.config.max_msgs > 0 {
            while self.messages.len() as i64 > self.config.max_msgs {
                self.remove_oldest();
            }
        }
        if self.config.max_bytes > 0 {
            while self.bytes as i64 > self.config.max_bytes && !self.messages.is_empty() {
                self.remove_oldest();
            }
        }
    }

    fn state(&self, options: &StreamInfoOptions) -> StreamState {
        let first_sequence = self.first_sequence();
        let distinct: HashSet<&str> = self.messages.values().map(|m| m.subject.as_str()).collect();

        let subjects = options.subjects_filter.as_ref().map(|filter| {
            let mut counts = HashMap::new();
            for message in self.messages.values() {
                if subject::matches(filter, &message.subject) {
                    *counts.entry(message.subject.clone()).or_insert(0) += 1;
                }
            }
            counts
        });

        let deleted: Vec<u64> = if self.messages.is_empty() {
            Vec::new()
        } else {
            (first_sequence..=self.last_sequence)
                .filter(|seq| !self.messages.contains_key(seq))
                .collect()
        };

        StreamState {
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            first_sequence,
            first_timestamp: self.messages.values().next().map(|m| m.time),
            last_sequence: self.last_sequence,
            last_timestamp: self.last_timestamp,
            consumer_count: self.consumers.len(),
            num_subjects: distinct.len() as u64,
            subjects,
            num_deleted: deleted.len() as u64,
            deleted: options.deleted_details.then_some(deleted),
        }
    }

    fn info(&self, options: &StreamInfoOptions) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            created: self.created,
            state: self.state(options),
        }
    }

    fn consumer_info(&self, consumer: &ConsumerEntry) -> ConsumerInfo {
        let num_pending = self
            .messages
            .range(consumer.next_sequence..)
            .filter(|(seq, m)| consumer.wants(**seq, m))
            .count() as u64;

        ConsumerInfo {
            stream_name: self.config.name.clone(),
            name: consumer.name.clone(),
            created: consumer.created,
            config: consumer.config.clone(),
            delivered: consumer.delivered.clone(),
            ack_floor: consumer.ack_floor.clone(),
            num_ack_pending: consumer.pending.len(),
            num_redelivered: consumer.pending.values().filter(|p| p.deliveries > 1).count(),
            num_waiting: 0,
            num_pending,
        }
    }

    /// Initial cursor for a new consumer
    fn start_position(&self, config: &ConsumerConfig) -> (u64, Option<(u64, HashSet<u64>)>) {
        let filter = config.filter_subject.as_deref();
        let matching = |m: &StoredMessage| filter.map_or(true, |f| subject::matches(f, &m.subject));
        let after_last = self.last_sequence + 1;

        match &config.deliver_policy {
            DeliverPolicy::All => (self.first_sequence().max(1), None),
            DeliverPolicy::New => (after_last, None),
            DeliverPolicy::Last => {
                let last = self
                    .messages
                    .iter()
                    .rev()
                    .find(|(_, m)| matching(m))
                    .map(|(seq, _)| *seq);
                (last.unwrap_or(after_last), None)
            }
            DeliverPolicy::ByStartSequence { start_sequence } => ((*start_sequence).max(1), None),
            DeliverPolicy::ByStartTime { start_time } => {
                let first = self
                    .messages
                    .iter()
                    .find(|(_, m)| m.time >= *start_time)
                    .map(|(seq, _)| *seq);
                (first.unwrap_or(after_last), None)
            }
            DeliverPolicy::LastPerSubject => {
                let mut last_by_subject: HashMap<&str, u64> = HashMap::new();
                for (seq, message) in &self.messages {
                    if matching(message) {
                        last_by_subject.insert(message.subject.as_str(), *seq);
                    }
                }
                let keep: HashSet<u64> = last_by_subject.into_values().collect();
                let start = keep.iter().min().copied().unwrap_or(after_last);
                (start, Some((self.last_sequence, keep)))
            }
        }
    }

    /// Interest retention: drop a message once every interested consumer has acked it
    fn release_if_unwanted(&mut self, sequence: u64) {
        let message = match self.messages.get(&sequence) {
            Some(m) => m,
            None => return,
        };
        let still_wanted = self.consumers.values().any(|c| {
            c.wants(sequence, message)
                && (sequence >= c.next_sequence || c.pending.contains_key(&sequence))
        });
        if !still_wanted {
            self.remove(sequence);
        }
    }
}

/// All streams held by a memory broker
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    streams: BTreeMap<String, StreamEntry>,
}

impl BrokerState {
    fn stream_mut(&mut self, name: &str) -> TransportResult<&mut StreamEntry> {
        self.streams.get_mut(name).ok_or_else(stream_not_found)
    }

    fn normalize_stream(config: &StreamConfig) -> TransportResult<StreamConfig> {
        if let Err(reason) = subject::validate_name(&config.name) {
            return Err(api(400, 10042, format!("invalid stream name: {}", reason)));
        }
        if config.replicas > MAX_REPLICAS {
            return Err(api(400, 10074, "replicas > 5 not supported"));
        }

        let mut normalized = config.clone();
        if normalized.subjects.is_empty() {
            normalized.subjects = vec![normalized.name.clone()];
        }
        if normalized.replicas == 0 {
            normalized.replicas = 1;
        }
        if normalized.duplicate_window.is_zero() {
            normalized.duplicate_window = DEFAULT_DUPLICATE_WINDOW;
            if !normalized.max_age.is_zero() && normalized.max_age < DEFAULT_DUPLICATE_WINDOW {
                normalized.duplicate_window = normalized.max_age;
            }
        }
        Ok(normalized)
    }

    fn check_overlap(&self, config: &StreamConfig) -> TransportResult<()> {
        let overlapping = self
            .streams
            .values()
            .filter(|s| s.config.name != config.name)
            .any(|s| {
                s.config
                    .subjects
                    .iter()
                    .any(|a| config.subjects.iter().any(|b| subject::overlaps(a, b)))
            });
        if overlapping {
            return Err(api(
                400,
                codes::STREAM_SUBJECT_OVERLAP,
                "subjects overlap with an existing stream",
            ));
        }
        Ok(())
    }

    pub fn create_stream(
        &mut self,
        config: &StreamConfig,
        now: DateTime<Utc>,
    ) -> TransportResult<StreamInfo> {
        let config = Self::normalize_stream(config)?;

        if let Some(existing) = self.streams.get(&config.name) {
            if existing.config == config {
                return Ok(existing.info(&StreamInfoOptions::default()));
            }
            return Err(api(
                400,
                codes::STREAM_NAME_IN_USE,
                "stream name already in use with a different configuration",
            ));
        }

        self.check_overlap(&config)?;
        let entry = StreamEntry::new(config.clone(), now);
        let info = entry.info(&StreamInfoOptions::default());
        self.streams.insert(config.name, entry);
        Ok(info)
    }

    pub fn update_stream(
        &mut self,
        config: &StreamConfig,
        now: DateTime<Utc>,
    ) -> TransportResult<StreamInfo> {
        let config = Self::normalize_stream(config)?;
        let existing = self.streams.get(&config.name).ok_or_else(stream_not_found)?;

        if existing.config.storage != config.storage {
            return Err(api(
                500,
                codes::STREAM_STORAGE_CHANGE,
                "stream configuration update can not change storage type",
            ));
        }
        if existing.config.retention != config.retention {
            return Err(api(
                500,
                codes::STREAM_STORAGE_CHANGE,
                "stream configuration update can not change retention policy",
            ));
        }
        self.check_overlap(&config)?;

        let stream = self.stream_mut(&config.name)?;
        stream.config = config;
        stream.expire(now);
        stream.enforce_limits();
        Ok(stream.info(&StreamInfoOptions::default()))
    }

    pub fn delete_stream(&mut self, name: &str) -> TransportResult<()> {
        self.streams.remove(name).map(|_| ()).ok_or_else(stream_not_found)
    }

    pub fn purge_stream(&mut self, name: &str, filter: Option<&str>) -> TransportResult<u64> {
        let stream = self.stream_mut(name)?;
        let doomed: Vec<u64> = stream
            .messages
            .iter()
            .filter(|(_, m)| filter.map_or(true, |f| subject::matches(f, &m.subject)))
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in &doomed {
            stream.remove(*sequence);
        }
        Ok(doomed.len() as u64)
    }

    pub fn stream_info(
        &mut self,
        name: &str,
        options: &StreamInfoOptions,
        now: DateTime<Utc>,
    ) -> TransportResult<StreamInfo> {
        let stream = self.stream_mut(name)?;
        stream.expire(now);
        Ok(stream.info(options))
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn account_usage(&self) -> (u64, u64, usize, usize) {
        let mut memory = 0;
        let mut storage = 0;
        let mut consumers = 0;
        for stream in self.streams.values() {
            match stream.config.storage {
                StorageType::Memory => memory += stream.bytes,
                StorageType::File => storage += stream.bytes,
            }
            consumers += stream.consumers.len();
        }
        (memory, storage, self.streams.len(), consumers)
    }

    pub fn publish(&mut self, message: Message, now: DateTime<Utc>) -> TransportResult<PubAck> {
        let stream = self
            .streams
            .values_mut()
            .find(|s| {
                s.config
                    .subjects
                    .iter()
                    .any(|p| subject::matches(p, &message.subject))
            })
            .ok_or(TransportError::NoResponders)?;

        stream.expire(now);
        let name = stream.config.name.clone();
        let headers = &message.headers;

        if let Some(expected) = headers.get(header::EXPECTED_STREAM) {
            if expected != name {
                return Err(api(400, codes::STREAM_NOT_MATCH, "expected stream does not match"));
            }
        }

        let msg_id = headers.get(header::MSG_ID).map(str::to_string);
        if let Some(ref id) = msg_id {
            if let Some((sequence, _)) = stream.dedup.get(id) {
                return Ok(PubAck {
                    stream: name,
                    sequence: *sequence,
                    duplicate: true,
                    domain: None,
                });
            }
        }

        if let Some(expected) = headers.get(header::EXPECTED_LAST_SEQUENCE) {
            let expected: u64 = expected.parse().map_err(|_| {
                api(400, codes::WRONG_LAST_SEQUENCE, "invalid expected last sequence")
            })?;
            if expected != stream.last_sequence {
                return Err(api(
                    400,
                    codes::WRONG_LAST_SEQUENCE,
                    format!("wrong last sequence: {}", stream.last_sequence),
                ));
            }
        }

        if let Some(expected) = headers.get(header::EXPECTED_LAST_MSG_ID) {
            if stream.last_msg_id.as_deref() != Some(expected) {
                return Err(api(
                    400,
                    codes::WRONG_LAST_MSG_ID,
                    format!(
                        "wrong last msg ID: {}",
                        stream.last_msg_id.as_deref().unwrap_or_default()
                    ),
                ));
            }
        }

        let stored = StoredMessage {
            subject: message.subject,
            headers: message.headers,
            payload: message.payload,
            time: now,
        };
        let size = stored.size();

        if stream.config.max_msg_size > 0 && size as i64 > stream.config.max_msg_size {
            return Err(api(400, 10054, "message size exceeds maximum allowed"));
        }
        if stream.config.discard == DiscardPolicy::New {
            if stream.config.max_msgs > 0 && stream.messages.len() as i64 >= stream.config.max_msgs {
                return Err(api(503, 10077, "maximum messages exceeded"));
            }
            if stream.config.max_bytes > 0 && (stream.bytes + size) as i64 > stream.config.max_bytes {
                return Err(api(503, 10078, "maximum bytes exceeded"));
            }
        }

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.bytes += size;
        stream.messages.insert(sequence, stored);
        stream.last_timestamp = Some(now);
        if let Some(id) = msg_id {
            stream.dedup.insert(id.clone(), (sequence, now));
            stream.last_msg_id = Some(id);
        }
        stream.enforce_limits();

        Ok(PubAck {
            stream: name,
            sequence,
            duplicate: false,
            domain: None,
        })
    }

    pub fn create_consumer(
        &mut self,
        stream_name: &str,
        config: &ConsumerConfig,
        action: ConsumerAction,
        now: DateTime<Utc>,
    ) -> TransportResult<ConsumerInfo> {
        let stream = self.stream_mut(stream_name)?;
        stream.expire(now);

        let mut config = config.clone();
        let name = match config.consumer_name() {
            Some(name) => {
                if let Err(reason) = subject::validate_name(name) {
                    return Err(api(400, 10103, format!("invalid consumer name: {}", reason)));
                }
                name.to_string()
            }
            None => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                config.name = Some(generated.clone());
                generated
            }
        };

        if let Some(ref filter) = config.filter_subject {
            let covered = stream
                .config
                .subjects
                .iter()
                .any(|s| subject::overlaps(s, filter));
            if !covered {
                return Err(api(
                    400,
                    10093,
                    "consumer filter subject is not a valid subset of the interest subjects",
                ));
            }
        }

        if let Some(existing) = stream.consumers.get_mut(&name) {
            if existing.config == config {
                let existing = &stream.consumers[&name];
                return Ok(stream.consumer_info(existing));
            }
            if action == ConsumerAction::Create {
                return Err(api(400, codes::CONSUMER_ALREADY_EXISTS, "consumer already exists"));
            }
            if existing.config.deliver_policy != config.deliver_policy {
                return Err(api(400, codes::CONSUMER_CREATE, "deliver policy can not be updated"));
            }
            if existing.config.ack_policy != config.ack_policy {
                return Err(api(400, codes::CONSUMER_CREATE, "ack policy can not be updated"));
            }
            if existing.config.durable_name != config.durable_name {
                return Err(api(400, codes::CONSUMER_CREATE, "durable name can not be updated"));
            }
            existing.config = config;
            let existing = &stream.consumers[&name];
            return Ok(stream.consumer_info(existing));
        }

        if action == ConsumerAction::Update {
            return Err(api(400, codes::CONSUMER_DOES_NOT_EXIST, "consumer does not exist"));
        }
        if stream.config.max_consumers > 0
            && stream.consumers.len() as i64 >= stream.config.max_consumers
        {
            return Err(api(400, 10026, "maximum consumers limit reached"));
        }
        if stream.config.retention == RetentionPolicy::WorkQueue {
            let clash = stream.consumers.values().any(|c| {
                match (&c.config.filter_subject, &config.filter_subject) {
                    (Some(a), Some(b)) => subject::overlaps(a, b),
                    _ => true,
                }
            });
            if clash {
                return Err(api(
                    400,
                    10100,
                    "filtered consumer not unique on workqueue stream",
                ));
            }
        }

        let (start, last_per_subject) = stream.start_position(&config);
        let floor = SequenceInfo {
            consumer_sequence: 0,
            stream_sequence: start - 1,
            last_active: None,
        };
        let entry = ConsumerEntry {
            name: name.clone(),
            config,
            created: now,
            next_sequence: start,
            delivered: floor.clone(),
            ack_floor: floor,
            pending: BTreeMap::new(),
            last_per_subject,
        };
        let info = stream.consumer_info(&entry);
        stream.consumers.insert(name, entry);
        Ok(info)
    }

    pub fn delete_consumer(&mut self, stream_name: &str, consumer: &str) -> TransportResult<()> {
        let stream = self.stream_mut(stream_name)?;
        stream
            .consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(consumer_not_found)
    }

    pub fn consumer_info(
        &mut self,
        stream_name: &str,
        consumer: &str,
        now: DateTime<Utc>,
    ) -> TransportResult<ConsumerInfo> {
        let stream = self.stream_mut(stream_name)?;
        stream.expire(now);
        let entry = stream.consumers.get(consumer).ok_or_else(consumer_not_found)?;
        Ok(stream.consumer_info(entry))
    }

    pub fn consumer_names(&mut self, stream_name: &str) -> TransportResult<Vec<String>> {
        let stream = self.stream_mut(stream_name)?;
        Ok(stream.consumers.keys().cloned().collect())
    }

    /// Collect up to `batch` deliveries: expired redeliveries first, then new messages
    pub fn deliver(
        &mut self,
        stream_name: &str,
        consumer: &str,
        batch: usize,
        now: DateTime<Utc>,
        instant: Instant,
    ) -> TransportResult<Vec<(Message, DeliveryInfo)>> {
        let stream = self.stream_mut(stream_name)?;
        stream.expire(now);

        let StreamEntry {
            config: stream_config,
            messages,
            consumers,
            ..
        } = stream;
        let entry = consumers.get_mut(consumer).ok_or_else(consumer_not_found)?;

        // (stream seq, deliveries, consumer seq)
        let mut picked: Vec<(u64, u64, u64)> = Vec::new();

        let due: Vec<u64> = entry
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= instant)
            .map(|(seq, _)| *seq)
            .collect();
        for sequence in due {
            if picked.len() >= batch {
                break;
            }
            let pending = match entry.pending.get(&sequence) {
                Some(p) => p.clone(),
                None => continue,
            };
            if !messages.contains_key(&sequence) || entry.exhausted(pending.deliveries) {
                entry.pending.remove(&sequence);
                continue;
            }
            entry.delivered.consumer_sequence += 1;
            let deliveries = pending.deliveries + 1;
            let wait = entry.redelivery_wait(deliveries);
            entry.pending.insert(
                sequence,
                Pending {
                    consumer_sequence: entry.delivered.consumer_sequence,
                    deliveries,
                    deadline: deadline_after(instant, wait),
                },
            );
            picked.push((sequence, deliveries, entry.delivered.consumer_sequence));
        }

        let mut cursor = entry.next_sequence;
        for (sequence, message) in messages.range(entry.next_sequence..) {
            if picked.len() >= batch {
                break;
            }
            if entry.tracks_acks()
                && entry.config.max_ack_pending > 0
                && entry.pending.len() as i64 >= entry.config.max_ack_pending
            {
                break;
            }
            cursor = sequence + 1;
            if !entry.wants(*sequence, message) {
                continue;
            }
            entry.delivered.consumer_sequence += 1;
            entry.delivered.stream_sequence = *sequence;
            if entry.tracks_acks() {
                entry.pending.insert(
                    *sequence,
                    Pending {
                        consumer_sequence: entry.delivered.consumer_sequence,
                        deliveries: 1,
                        deadline: deadline_after(instant, entry.redelivery_wait(1)),
                    },
                );
            }
            picked.push((*sequence, 1, entry.delivered.consumer_sequence));
        }
        entry.next_sequence = entry.next_sequence.max(cursor);
        if !picked.is_empty() {
            entry.delivered.last_active = Some(now);
        }
        if entry.tracks_acks() {
            entry.refresh_ack_floor();
        } else {
            entry.ack_floor = entry.delivered.clone();
        }

        let remaining = messages
            .range(entry.next_sequence..)
            .filter(|(seq, m)| entry.wants(**seq, m))
            .count() as u64;

        let total = picked.len() as u64;
        let out = picked
            .into_iter()
            .enumerate()
            .filter_map(|(i, (sequence, deliveries, consumer_sequence))| {
                let stored = messages.get(&sequence)?;
                let info = DeliveryInfo {
                    domain: None,
                    stream: stream_config.name.clone(),
                    consumer: entry.name.clone(),
                    delivered: deliveries,
                    stream_sequence: sequence,
                    consumer_sequence,
                    published: stored.time,
                    pending: remaining + total - 1 - i as u64,
                };
                let message = Message {
                    subject: stored.subject.clone(),
                    payload: stored.payload.clone(),
                    headers: stored.headers.clone(),
                };
                Some((message, info))
            })
            .collect();
        Ok(out)
    }

    /// Apply an acknowledgement; unknown deliveries are ignored like the server does
    pub fn ack(
        &mut self,
        stream_name: &str,
        consumer: &str,
        sequence: u64,
        kind: AckKind,
        instant: Instant,
    ) {
        let stream = match self.streams.get_mut(stream_name) {
            Some(s) => s,
            None => return,
        };
        let entry = match stream.consumers.get_mut(consumer) {
            Some(c) => c,
            None => return,
        };

        let mut released = Vec::new();
        match kind {
            AckKind::Ack | AckKind::Term => {
                if entry.config.ack_policy == AckPolicy::All && kind == AckKind::Ack {
                    let acked: Vec<u64> = entry.pending.range(..=sequence).map(|(s, _)| *s).collect();
                    for s in acked {
                        entry.pending.remove(&s);
                        released.push(s);
                    }
                } else if entry.pending.remove(&sequence).is_some() {
                    released.push(sequence);
                }
                entry.refresh_ack_floor();
            }
            AckKind::Nak(delay) => {
                if let Some(pending) = entry.pending.get_mut(&sequence) {
                    pending.deadline = deadline_after(instant, delay.unwrap_or(Duration::ZERO));
                }
            }
            AckKind::Progress => {
                let wait = entry.config.ack_wait;
                if let Some(pending) = entry.pending.get_mut(&sequence) {
                    pending.deadline = deadline_after(instant, wait);
                }
            }
        }

        match stream.config.retention {
            RetentionPolicy::WorkQueue => {
                for s in released {
                    stream.remove(s);
                }
            }
            RetentionPolicy::Interest => {
                for s in released {
                    stream.release_if_unwanted(s);
                }
            }
            RetentionPolicy::Limits => {}
        }
    }

    /// Earliest redelivery deadline of a consumer, if any
    pub fn next_deadline(&self, stream_name: &str, consumer: &str) -> Option<Instant> {
        self.streams
            .get(stream_name)?
            .consumers
            .get(consumer)?
            .pending
            .values()
            .map(|p| p.deadline)
            .min()
    }
}
