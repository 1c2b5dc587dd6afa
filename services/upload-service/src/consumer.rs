//! Inbound side of the event bus.
//!
//! [`ConsumerLoop`] owns the single consumer connection, subscribed to the
//! validation topic. Each verdict is handed to the [`ValidationHandler`] and
//! awaited before the next one is looked at.

use crate::config::KafkaConfig;
use crate::status::ConnectionStatus;
use crate::validation::{ValidationHandler, ValidationVerdict};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to reach brokers: {0}")]
    ConnectError(String),

    #[error("Consumer poll error: {0}")]
    PollError(String),

    #[error("Consumer is not connected")]
    NotConnected,
}

/// A record taken off the bus, detached from the client that fetched it
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// A broker connection records can be polled from
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Establish (or re-establish) the connection and subscription
    async fn connect(&self) -> Result<(), ConsumerError>;

    /// Wait up to the poll timeout for records; an empty batch is not an error
    async fn poll_batch(&self) -> Result<Vec<InboundRecord>, ConsumerError>;
}

/// Kafka-backed [`RecordSource`]
pub struct KafkaRecordSource {
    config: KafkaConfig,
    consumer: RwLock<Option<Arc<StreamConsumer>>>,
}

impl KafkaRecordSource {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            consumer: RwLock::new(None),
        }
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn connect(&self) -> Result<(), ConsumerError> {
        info!(
            brokers = %self.config.bootstrap_servers,
            group_id = %self.config.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[self.config.validation_topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        let consumer = Arc::new(consumer);
        let probe = consumer.clone();
        let topic = self.config.validation_topic.clone();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| ConsumerError::ConnectError(e.to_string()))?
        .map_err(|e| ConsumerError::ConnectError(e.to_string()))?;

        *self.consumer.write() = Some(consumer);
        Ok(())
    }

    async fn poll_batch(&self) -> Result<Vec<InboundRecord>, ConsumerError> {
        let consumer = self
            .consumer
            .read()
            .clone()
            .ok_or(ConsumerError::NotConnected)?;

        let first = match tokio::time::timeout(self.config.poll_timeout(), consumer.recv()).await {
            Ok(received) => received.map(|m| InboundRecord::from_message(&m)),
            Err(_) => return Ok(Vec::new()),
        };

        // Take whatever is already buffered without waiting again
        let ready = || {
            consumer
                .recv()
                .now_or_never()
                .map(|received| received.map(|m| InboundRecord::from_message(&m)))
        };

        collect_ready(first, ready, self.config.max_poll_records).map_err(|e| {
            self.consumer.write().take();
            ConsumerError::PollError(e.to_string())
        })
    }
}

impl InboundRecord {
    fn from_message<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_string(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }
}

/// Build a batch from a first receive and whatever is ready after it.
///
/// Only a failed first receive is an error. A later failure ends the batch
/// early and keeps the records already taken; the next poll surfaces it again.
fn collect_ready<E, F>(
    first: Result<InboundRecord, E>,
    mut ready: F,
    max_records: usize,
) -> Result<Vec<InboundRecord>, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Option<Result<InboundRecord, E>>,
{
    let mut batch = vec![first?];

    while batch.len() < max_records {
        match ready() {
            Some(Ok(record)) => batch.push(record),
            Some(Err(e)) => {
                warn!(
                    error = %e,
                    kept = batch.len(),
                    "Receive failed mid-batch, handling records already taken"
                );
                break;
            }
            None => break,
        }
    }

    Ok(batch)
}

/// What one poll achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Records were polled; `handled` of them were dispatched as verdicts
    Processed { polled: usize, handled: usize },
    /// The broker failed; the connection must be re-established
    Disconnected,
}

/// Long-lived task feeding validation verdicts to the handler
pub struct ConsumerLoop {
    source: Arc<dyn RecordSource>,
    handler: Arc<ValidationHandler>,
    status: Arc<ConnectionStatus>,
    validation_topic: String,
    retry_interval: Duration,
    idle_interval: Duration,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn RecordSource>,
        handler: Arc<ValidationHandler>,
        status: Arc<ConnectionStatus>,
        validation_topic: impl Into<String>,
        retry_interval: Duration,
        idle_interval: Duration,
    ) -> Self {
        Self {
            source,
            handler,
            status,
            validation_topic: validation_topic.into(),
            retry_interval,
            idle_interval,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(topic = %self.validation_topic, "Starting consumer loop");
        self.status.set_consumer_connected(false);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = if !self.status.consumer_connected() {
                if self.connect().await {
                    None
                } else {
                    Some(self.retry_interval)
                }
            } else {
                match self.poll_once().await {
                    PollOutcome::Processed { .. } => Some(self.idle_interval),
                    PollOutcome::Disconnected => None,
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!("Consumer loop stopped");
    }

    /// One handshake attempt. Returns whether the consumer is now connected.
    pub async fn connect(&self) -> bool {
        info!("Consumer client not connected, attempting to connect...");

        match self.source.connect().await {
            Ok(()) => {
                info!("Consumer client connected");
                self.status.set_consumer_connected(true);
                true
            }
            Err(e) => {
                error!(error = %e, "Consumer client hit error, triggering re-connect");
                self.status.set_consumer_connected(false);
                false
            }
        }
    }

    /// Poll one batch and dispatch every verdict in it, in order
    pub async fn poll_once(&self) -> PollOutcome {
        let batch = match self.source.poll_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "Consumer client hit error, triggering re-connect");
                self.status.set_consumer_connected(false);
                return PollOutcome::Disconnected;
            }
        };

        let polled = batch.len();
        let mut handled = 0;

        for record in batch {
            if record.topic != self.validation_topic {
                debug!(topic = %record.topic, "Skipping record from unexpected topic");
                continue;
            }

            match ValidationVerdict::from_slice(&record.payload) {
                Ok(verdict) => {
                    self.handler.handle(verdict).await;
                    handled += 1;
                }
                Err(e) => {
                    metrics::counter!("consumer.records.dropped").increment(1);
                    warn!(
                        error = %e,
                        partition = record.partition,
                        offset = record.offset,
                        "Dropping unusable validation record"
                    );
                }
            }
        }

        PollOutcome::Processed { polled, handled }
    }
}
