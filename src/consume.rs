//! Consume loop
//!
//! Pulls from an existing consumer and runs a handler per message with
//! bounded concurrency. Each pull asks for no more messages than there
//! are free handler slots, so nothing sits fetched-but-idle for long.
//!
//! Stopping is cooperative: once stop is signalled no new handler starts,
//! handlers already running are awaited, and anything fetched but not yet
//! dispatched is left unacknowledged for the broker to redeliver after
//! `ack_wait`.

use crate::connection::ConnectionManager;
use crate::consumer::{AckPolicy, ConsumerConfig, ConsumerRegistry};
use crate::dlq::{should_dead_letter, DeadLetter, DeadLetterHandler};
use crate::error::{translate, Boundary, JetStreamError, Result};
use crate::message::JsMessage;
use crate::stream::check_name;
use crate::transport::{PullRequest, Transport};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes delivered messages
///
/// Implemented for any `Fn(JsMessage) -> impl Future<Output = Result<(), E>>`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: JsMessage) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut, E> MessageHandler for F
where
    F: Fn(JsMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    async fn handle(&self, message: JsMessage) -> std::result::Result<(), HandlerError> {
        (self)(message).await.map_err(Into::into)
    }
}

/// Consume loop options
#[derive(Clone)]
pub struct ConsumeOptions {
    /// Largest pull request
    pub batch: usize,

    /// Concurrent handler invocations
    pub max_in_flight: usize,

    /// How long a pull request waits for messages
    pub expires: Duration,

    /// Ack on handler success, nak on handler failure
    pub auto_ack: bool,

    /// Pause after a failed pull before trying again
    pub retry_delay: Duration,

    /// Configuration for the ephemeral consumer created when no name is given
    pub ephemeral: Option<ConsumerConfig>,

    /// Receives messages that fail on their final delivery attempt
    pub dead_letter: Option<Arc<dyn DeadLetterHandler>>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            batch: 10,
            max_in_flight: 10,
            expires: Duration::from_secs(5),
            auto_ack: true,
            retry_delay: Duration::from_secs(1),
            ephemeral: None,
            dead_letter: None,
        }
    }
}

impl fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("batch", &self.batch)
            .field("max_in_flight", &self.max_in_flight)
            .field("expires", &self.expires)
            .field("auto_ack", &self.auto_ack)
            .field("retry_delay", &self.retry_delay)
            .field("ephemeral", &self.ephemeral)
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

impl ConsumeOptions {
    /// Set the largest pull request
    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    /// Set the number of concurrent handler invocations
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set how long each pull request waits
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    /// Ack and nak from handler results
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Set the pause after a failed pull
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Configure the consumer created when no name is given
    pub fn ephemeral(mut self, config: ConsumerConfig) -> Self {
        self.ephemeral = Some(config);
        self
    }

    /// Route final failures to `handler`
    pub fn dead_letter(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter = Some(handler);
        self
    }
}

/// Counters for one consume loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    /// Messages handed to the handler
    pub delivered: u64,
    pub acked: u64,
    pub naked: u64,
    pub dead_lettered: u64,
    /// Handler invocations that returned an error
    pub handler_errors: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    naked: AtomicU64,
    dead_lettered: AtomicU64,
    handler_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumeStats {
        ConsumeStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            naked: self.naked.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Handle to a running consume loop
///
/// Dropping the handle signals stop without waiting for in-flight handlers.
pub struct ConsumeHandle {
    stream: String,
    consumer: String,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
    counters: Arc<Counters>,
}

impl fmt::Debug for ConsumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeHandle")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConsumeHandle {
    /// Stream being consumed
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Name of the consumer being drained (generated for ephemerals)
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Live counters
    pub fn stats(&self) -> ConsumeStats {
        self.counters.snapshot()
    }

    /// Whether the loop has ended on its own
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Stop the loop and wait for in-flight handlers to finish
    pub async fn stop(mut self) -> Result<ConsumeStats> {
        let _ = self.stop.send(true);
        self.join().await
    }

    /// Wait for the loop to end on its own (its consumer or stream disappeared)
    pub async fn wait(mut self) -> Result<ConsumeStats> {
        self.join().await
    }

    async fn join(&mut self) -> Result<ConsumeStats> {
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| JetStreamError::Unknown {
                resource: format!("consume loop on consumer '{}'", self.consumer),
                status: None,
                raw_code: None,
                description: e.to_string(),
            })??;
        }
        Ok(self.counters.snapshot())
    }
}

impl Drop for ConsumeHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

struct Dispatcher {
    handler: Arc<dyn MessageHandler>,
    auto_ack: bool,
    acks: bool,
    max_deliver: i64,
    dead_letter: Option<Arc<dyn DeadLetterHandler>>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    async fn dispatch(&self, message: JsMessage, _permit: OwnedSemaphorePermit) {
        let result = self.handler.handle(message.clone()).await;
        let info = message.info();

        let outcome = match result {
            Ok(()) => {
                if !(self.auto_ack && self.acks) {
                    return;
                }
                message.ack().await.map(|_| bump(&self.counters.acked))
            }
            Err(e) => {
                bump(&self.counters.handler_errors);
                tracing::warn!(
                    subject = %message.subject(),
                    stream_sequence = info.stream_sequence,
                    delivered = info.delivered,
                    error = %e,
                    "Message handler failed"
                );

                match self.dead_letter {
                    Some(ref dlq) if self.acks && should_dead_letter(info, self.max_deliver) => {
                        match dlq.handle(DeadLetter::new(&message, e.to_string())).await {
                            Ok(()) => {
                                bump(&self.counters.dead_lettered);
                                message.term().await
                            }
                            Err(dlq_err) => Err(dlq_err),
                        }
                    }
                    _ if self.auto_ack && self.acks => {
                        message.nak().await.map(|_| bump(&self.counters.naked))
                    }
                    _ => Ok(()),
                }
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(
                subject = %message.subject(),
                stream_sequence = info.stream_sequence,
                error = %e,
                "Failed to settle message"
            );
        }
    }
}

struct PullLoop {
    transport: Arc<dyn Transport>,
    stream: String,
    consumer: String,
    ephemeral: bool,
    batch: usize,
    max_in_flight: usize,
    expires: Duration,
    retry_delay: Duration,
    dispatcher: Arc<Dispatcher>,
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

impl PullLoop {
    async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let resource = format!("consumer '{}' on stream '{}'", self.consumer, self.stream);
        let mut outcome = Ok(());

        'fetch: loop {
            if stopped(&stop) {
                break;
            }

            let first = tokio::select! {
                biased;
                _ = stop.changed() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch = self.batch.min(slots.available_permits() + 1);
            let request = PullRequest::new(batch, self.expires);
            let fetched = tokio::select! {
                biased;
                _ = stop.changed() => break,
                fetched = self.transport.fetch(&self.stream, &self.consumer, &request) => fetched,
            };

            let deliveries = match fetched {
                Ok(deliveries) => deliveries,
                Err(e) => match translate(e, Boundary::Fetch(&resource)) {
                    JetStreamError::Timeout { .. } => continue,
                    err if err.is_not_found() => {
                        tracing::warn!(
                            stream = %self.stream,
                            consumer = %self.consumer,
                            error = %err,
                            "Consumer gone, consume loop ending"
                        );
                        outcome = Err(err);
                        break;
                    }
                    err => {
                        tracing::warn!(
                            stream = %self.stream,
                            consumer = %self.consumer,
                            error = %err,
                            "Pull failed, retrying"
                        );
                        drop(first);
                        tokio::select! {
                            biased;
                            _ = stop.changed() => break,
                            _ = tokio::time::sleep(self.retry_delay) => continue,
                        }
                    }
                },
            };

            if !deliveries.is_empty() {
                tracing::debug!(
                    consumer = %self.consumer,
                    requested = batch,
                    received = deliveries.len(),
                    "Pulled messages"
                );
            }

            let mut spare = Some(first);
            for delivery in deliveries {
                let permit = match spare.take() {
                    Some(permit) => permit,
                    None => tokio::select! {
                        biased;
                        _ = stop.changed() => break 'fetch,
                        permit = slots.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break 'fetch,
                        },
                    },
                };
                if stopped(&stop) {
                    break 'fetch;
                }

                let message = JsMessage::from(delivery);
                bump(&self.dispatcher.counters.delivered);
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move { dispatcher.dispatch(message, permit).await });
            }
        }

        // Every handler holds a slot; owning all of them means none is running
        let _ = slots.acquire_many(self.max_in_flight as u32).await;

        if self.ephemeral {
            if let Err(e) = self
                .transport
                .delete_consumer(&self.stream, &self.consumer)
                .await
            {
                tracing::debug!(consumer = %self.consumer, error = %e, "Ephemeral consumer cleanup failed");
            }
        }

        tracing::info!(
            stream = %self.stream,
            consumer = %self.consumer,
            "Consume loop stopped"
        );
        outcome
    }
}

/// Start a consume loop
///
/// With a consumer name the consumer must already exist (`NotFound`
/// otherwise). Without one, a consumer is created from `options.ephemeral`.
/// It is removed again when the loop ends unless that config names a
/// durable. Under `AckPolicy::All` handlers run one at a time whatever
/// `max_in_flight` says.
pub async fn consume<H: MessageHandler>(
    connection: Arc<ConnectionManager>,
    stream: &str,
    consumer: Option<&str>,
    options: ConsumeOptions,
    handler: H,
) -> Result<ConsumeHandle> {
    if options.batch == 0 || options.max_in_flight == 0 {
        return Err(JetStreamError::Config(
            "batch and max_in_flight must be greater than zero".to_string(),
        ));
    }
    if options.max_in_flight > Semaphore::MAX_PERMITS.min(u32::MAX as usize) {
        return Err(JetStreamError::Config(format!(
            "max_in_flight must be at most {}",
            Semaphore::MAX_PERMITS.min(u32::MAX as usize)
        )));
    }
    check_name(stream)?;

    let registry = ConsumerRegistry::new(connection.clone());
    let info = match consumer {
        Some(name) => registry.info(stream, name).await?,
        None => {
            let config = options
                .ephemeral
                .clone()
                .unwrap_or_else(ConsumerConfig::ephemeral);
            registry.create(stream, &config).await?
        }
    };
    let js = connection.jetstream().await?;

    // Acking one sequence settles every earlier one, so handlers run one at a time
    let max_in_flight = if info.config.ack_policy == AckPolicy::All {
        1
    } else {
        options.max_in_flight
    };

    let counters = Arc::new(Counters::default());
    let dispatcher = Arc::new(Dispatcher {
        handler: Arc::new(handler),
        auto_ack: options.auto_ack,
        acks: info.config.ack_policy != AckPolicy::None,
        max_deliver: info.config.max_deliver,
        dead_letter: options.dead_letter.clone(),
        counters: counters.clone(),
    });

    let pull = PullLoop {
        transport: js.transport().clone(),
        stream: stream.to_string(),
        consumer: info.name.clone(),
        ephemeral: consumer.is_none() && info.config.durable_name.is_none(),
        batch: options.batch,
        max_in_flight,
        expires: options.expires,
        retry_delay: options.retry_delay,
        dispatcher,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(pull.run(stop_rx));

    tracing::info!(
        stream = %stream,
        consumer = %info.name,
        batch = options.batch,
        max_in_flight,
        "Consume loop started"
    );

    Ok(ConsumeHandle {
        stream: stream.to_string(),
        consumer: info.name,
        stop: stop_tx,
        task: Some(task),
        counters,
    })
}
