//! In-memory JetStream transport
//!
//! A single-process broker with JetStream API semantics: streams with
//! wildcard subjects and limits, deduplication, optimistic concurrency,
//! durable and ephemeral consumers, ack tracking and redelivery.
//!
//! Useful for tests, benches and single-process deployments. Test hooks
//! can switch JetStream off, drop the connection, slow down publish acks
//! and count requests.

mod broker;

use crate::config::ClientConfig;
use crate::consumer::{ConsumerConfig, ConsumerInfo};
use crate::message::Message;
use crate::stream::{StreamConfig, StreamInfo, StreamInfoOptions};
use crate::transport::{
    codes, AccountInfo, AckKind, Acker, ApiError, ConsumerAction, Connector, Delivery,
    DeliveryInfo, PubAck, PullRequest, Transport, TransportError, TransportResult,
};
use async_trait::async_trait;
use broker::BrokerState;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Pull requests without an expiry wait this long
const DEFAULT_FETCH_EXPIRY: Duration = Duration::from_secs(5);

/// Upper bound between redelivery checks while a pull request waits
const REDELIVERY_POLL: Duration = Duration::from_millis(20);

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    jetstream_enabled: AtomicBool,
    connected: AtomicBool,
    requests: AtomicU64,
    connections: AtomicU64,
    publish_delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
}

/// Handle to an in-memory broker
///
/// Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A connected broker with JetStream enabled
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                jetstream_enabled: AtomicBool::new(true),
                connected: AtomicBool::new(true),
                requests: AtomicU64::new(0),
                connections: AtomicU64::new(0),
                publish_delay: Mutex::new(None),
                connect_delay: Mutex::new(None),
            }),
        }
    }

    /// A transport bound to this broker
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// A connector that hands out transports bound to this broker
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Enable or disable the JetStream subsystem on the broker
    pub fn set_jetstream_enabled(&self, enabled: bool) {
        self.shared.jetstream_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Simulate the connection going down or coming back
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Delay every publish acknowledgement
    ///
    /// The message is stored once the delay has passed. A publish whose
    /// timeout runs out first fails with `TimedOut` and stores nothing.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.shared.publish_delay.lock() {
            *slot = delay;
        }
    }

    /// Delay every connection handshake
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.shared.connect_delay.lock() {
            *slot = delay;
        }
    }

    /// Number of requests that reached the broker
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Number of connection handshakes performed
    pub fn connection_count(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn jetstream_enabled(&self) -> bool {
        self.shared.jetstream_enabled.load(Ordering::SeqCst)
    }

    fn state(&self) -> TransportResult<MutexGuard<'_, BrokerState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| TransportError::Io("memory broker state poisoned".to_string()))
    }

    fn delay(slot: &Mutex<Option<Duration>>) -> Option<Duration> {
        slot.lock().ok().and_then(|d| *d)
    }

    /// Count a request and check the connection
    fn enter(&self) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected(
                "memory broker is offline".to_string(),
            ));
        }
        self.shared.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// `enter` plus the JetStream API availability check
    fn enter_api(&self) -> TransportResult<()> {
        self.enter()?;
        if !self.jetstream_enabled() {
            return Err(TransportError::Api(ApiError::new(
                503,
                codes::NOT_ENABLED_FOR_ACCOUNT,
                "jetstream not enabled for account",
            )));
        }
        Ok(())
    }
}

/// Transport backed by a `MemoryBroker`
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    /// The broker this transport talks to
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    async fn account_info(&self) -> TransportResult<AccountInfo> {
        self.broker.enter_api()?;
        let (memory, storage, streams, consumers) = self.broker.state()?.account_usage();
        Ok(AccountInfo {
            memory,
            storage,
            streams,
            consumers,
            domain: None,
        })
    }

    async fn create_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo> {
        self.broker.enter_api()?;
        self.broker.state()?.create_stream(config, Utc::now())
    }

    async fn update_stream(&self, config: &StreamConfig) -> TransportResult<StreamInfo> {
        self.broker.enter_api()?;
        let info = self.broker.state()?.update_stream(config, Utc::now())?;
        self.broker.shared.notify.notify_waiters();
        Ok(info)
    }

    async fn delete_stream(&self, name: &str) -> TransportResult<()> {
        self.broker.enter_api()?;
        self.broker.state()?.delete_stream(name)?;
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn purge_stream(&self, name: &str, subject: Option<&str>) -> TransportResult<u64> {
        self.broker.enter_api()?;
        self.broker.state()?.purge_stream(name, subject)
    }

    async fn stream_info(
        &self,
        name: &str,
        options: &StreamInfoOptions,
    ) -> TransportResult<StreamInfo> {
        self.broker.enter_api()?;
        self.broker.state()?.stream_info(name, options, Utc::now())
    }

    async fn stream_names(&self) -> TransportResult<Vec<String>> {
        self.broker.enter_api()?;
        Ok(self.broker.state()?.stream_names())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
        action: ConsumerAction,
    ) -> TransportResult<ConsumerInfo> {
        self.broker.enter_api()?;
        let info = self
            .broker
            .state()?
            .create_consumer(stream, config, action, Utc::now())?;
        self.broker.shared.notify.notify_waiters();
        Ok(info)
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> TransportResult<()> {
        self.broker.enter_api()?;
        self.broker.state()?.delete_consumer(stream, consumer)?;
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, consumer: &str) -> TransportResult<ConsumerInfo> {
        self.broker.enter_api()?;
        self.broker.state()?.consumer_info(stream, consumer, Utc::now())
    }

    async fn consumer_names(&self, stream: &str) -> TransportResult<Vec<String>> {
        self.broker.enter_api()?;
        self.broker.state()?.consumer_names(stream)
    }

    async fn publish(&self, message: Message, timeout: Duration) -> TransportResult<PubAck> {
        self.broker.enter()?;
        if let Some(delay) = MemoryBroker::delay(&self.broker.shared.publish_delay) {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::TimedOut);
            }
            tokio::time::sleep(delay).await;
        }
        if !self.broker.jetstream_enabled() {
            return Err(TransportError::NoResponders);
        }
        let ack = self.broker.state()?.publish(message, Utc::now())?;
        self.broker.shared.notify.notify_waiters();
        Ok(ack)
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        request: &PullRequest,
    ) -> TransportResult<Vec<Delivery>> {
        self.broker.enter_api()?;
        let expiry = if request.no_wait {
            Duration::ZERO
        } else {
            request.expires.unwrap_or(DEFAULT_FETCH_EXPIRY)
        };
        let deadline = Instant::now() + expiry;

        loop {
            let notified = self.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_redelivery = {
                let mut state = self.broker.state()?;
                let batch =
                    state.deliver(stream, consumer, request.batch, Utc::now(), Instant::now())?;
                if !batch.is_empty() {
                    return Ok(batch
                        .into_iter()
                        .map(|(message, info)| self.delivery(message, info))
                        .collect());
                }
                state.next_deadline(stream, consumer)
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if !self.broker.is_connected() {
                return Err(TransportError::Disconnected(
                    "memory broker went offline".to_string(),
                ));
            }

            let mut wait = deadline - now;
            if let Some(at) = next_redelivery {
                wait = wait.min(at.saturating_duration_since(now).max(REDELIVERY_POLL));
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

}

impl MemoryTransport {
    fn delivery(&self, message: Message, info: DeliveryInfo) -> Delivery {
        let acker = MemoryAcker {
            broker: self.broker.clone(),
            stream: info.stream.clone(),
            consumer: info.consumer.clone(),
            sequence: info.stream_sequence,
        };
        Delivery {
            message,
            info,
            acker: Arc::new(acker),
        }
    }
}

/// Acknowledges one delivery on a `MemoryBroker`
struct MemoryAcker {
    broker: MemoryBroker,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, kind: AckKind) -> TransportResult<()> {
        self.broker.enter()?;
        self.broker.state()?.ack(
            &self.stream,
            &self.consumer,
            self.sequence,
            kind,
            Instant::now(),
        );
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Connector for `MemoryBroker`
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &ClientConfig) -> TransportResult<Arc<dyn Transport>> {
        self.broker.shared.connections.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = MemoryBroker::delay(&self.broker.shared.connect_delay) {
            tokio::time::sleep(delay).await;
        }
        if !self.broker.is_connected() {
            return Err(TransportError::Disconnected(
                "memory broker is offline".to_string(),
            ));
        }
        tracing::debug!("Connected to memory broker");
        Ok(Arc::new(self.broker.transport()))
    }
}
