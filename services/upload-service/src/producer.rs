//! Outbound side of the event bus.
//!
//! [`ProducerLoop`] owns the single producer connection. It drains the
//! [`ProduceQueue`] in insertion order and publishes each event, reconnecting
//! whenever the broker reports an error. An event whose publish fails goes
//! back to the head of the queue together with the rest of its batch, so
//! delivery is at-least-once for every event that was not evicted.

use crate::config::KafkaConfig;
use crate::messages::OutboundEvent;
use crate::produce_queue::ProduceQueue;
use crate::status::ConnectionStatus;
use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to reach brokers: {0}")]
    ConnectError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer is not connected")]
    NotConnected,
}

impl ProducerError {
    /// Whether the error means the connection is unusable
    pub fn is_broker_error(&self) -> bool {
        !matches!(self, ProducerError::SerializationError(_))
    }
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A broker connection events can be published on
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> Result<(), ProducerError>;

    /// Publish one event and wait for the broker's acknowledgment
    async fn publish(&self, event: &OutboundEvent) -> Result<DeliveryResult, ProducerError>;
}

/// Kafka-backed [`EventPublisher`]
pub struct KafkaPublisher {
    config: KafkaConfig,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaPublisher {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn connect(&self) -> Result<(), ProducerError> {
        info!(
            brokers = %self.config.bootstrap_servers,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = self
            .config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        // librdkafka connects lazily; a metadata round trip proves the brokers answer
        let probe = producer.clone();
        let timeout = self.config.request_timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| ProducerError::ConnectError(e.to_string()))?
        .map_err(|e| ProducerError::ConnectError(e.to_string()))?;

        *self.producer.write() = Some(producer);
        Ok(())
    }

    #[instrument(skip(self, event), fields(topic = %event.topic(), key = ?event.key()))]
    async fn publish(&self, event: &OutboundEvent) -> Result<DeliveryResult, ProducerError> {
        let producer = self
            .producer
            .read()
            .clone()
            .ok_or(ProducerError::NotConnected)?;

        let payload = event
            .payload_bytes()
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;

        let mut record = FutureRecord::to(event.topic()).payload(&payload);
        if let Some(key) = event.key() {
            record = record.key(key);
        }

        debug!(size_bytes = payload.len(), "Sending message");

        let (partition, offset) = producer
            .send(record, Timeout::After(self.config.request_timeout()))
            .await
            .map_err(|(e, _)| {
                // A failed send leaves the handle suspect; force a fresh one on reconnect
                self.producer.write().take();
                ProducerError::SendError {
                    topic: event.topic().to_string(),
                    message: e.to_string(),
                }
            })?;

        Ok(DeliveryResult {
            topic: event.topic().to_string(),
            partition,
            offset,
        })
    }
}

/// What one pass over the produce queue achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was queued
    Idle,
    /// Every dequeued event was published
    Drained(usize),
    /// The broker failed mid-batch; unsent events were requeued
    Disconnected { sent: usize, requeued: usize },
}

/// Long-lived task moving events from the produce queue to the broker
pub struct ProducerLoop {
    publisher: Arc<dyn EventPublisher>,
    queue: Arc<ProduceQueue>,
    status: Arc<ConnectionStatus>,
    retry_interval: Duration,
    idle_interval: Duration,
}

impl ProducerLoop {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        queue: Arc<ProduceQueue>,
        status: Arc<ConnectionStatus>,
        retry_interval: Duration,
        idle_interval: Duration,
    ) -> Self {
        Self {
            publisher,
            queue,
            status,
            retry_interval,
            idle_interval,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting producer loop");
        self.status.set_producer_connected(false);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = if !self.status.producer_connected() {
                if self.connect().await {
                    None
                } else {
                    Some(self.retry_interval)
                }
            } else {
                match self.drain().await {
                    DrainOutcome::Idle => Some(self.idle_interval),
                    DrainOutcome::Drained(_) => None,
                    DrainOutcome::Disconnected { .. } => {
                        tokio::task::yield_now().await;
                        None
                    }
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(queue_len = self.queue.len(), "Producer loop stopped");
    }

    /// One handshake attempt. Returns whether the producer is now connected.
    pub async fn connect(&self) -> bool {
        info!("Producer client not connected, attempting to connect...");

        match self.publisher.connect().await {
            Ok(()) => {
                info!("Producer client connected");
                self.status.set_producer_connected(true);
                true
            }
            Err(e) => {
                error!(error = %e, "Producer client hit error, triggering re-connect");
                self.status.set_producer_connected(false);
                false
            }
        }
    }

    /// Publish everything currently queued, oldest first
    pub async fn drain(&self) -> DrainOutcome {
        let batch = self.queue.dequeue_all();
        if batch.is_empty() {
            return DrainOutcome::Idle;
        }

        let total = batch.len();
        let mut pending = batch.into_iter();
        let mut sent = 0;
        let mut attempted = 0;

        while let Some(event) = pending.next() {
            attempted += 1;
            info!(
                topic = %event.topic(),
                payload_id = event.payload_id().unwrap_or("unknown"),
                queue_len = total - attempted + self.queue.len(),
                "Popped item from produce queue"
            );

            match self.publisher.publish(&event).await {
                Ok(delivery) => {
                    sent += 1;
                    metrics::counter!("producer.messages.sent").increment(1);
                    info!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        payload_id = event.payload_id().unwrap_or("unknown"),
                        "Produced event"
                    );
                }
                Err(e) if !e.is_broker_error() => {
                    metrics::counter!("producer.errors").increment(1);
                    error!(error = %e, topic = %event.topic(), "Dropping unpublishable event");
                }
                Err(e) => {
                    metrics::counter!("producer.errors").increment(1);
                    error!(error = %e, "Producer client hit error, triggering re-connect");
                    self.status.set_producer_connected(false);

                    let mut unsent = Vec::with_capacity(total - attempted + 1);
                    unsent.push(event);
                    unsent.extend(pending);
                    let requeued = unsent.len();
                    self.queue.requeue_front(unsent);

                    return DrainOutcome::Disconnected { sent, requeued };
                }
            }
        }

        DrainOutcome::Drained(sent)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory publisher that fails on demand
    #[derive(Default)]
    pub(crate) struct ScriptedPublisher {
        pub connect_failures: AtomicUsize,
        pub connect_calls: AtomicUsize,
        pub publish_calls: AtomicUsize,
        /// Zero-based publish attempts that fail with a broker error
        pub failing_attempts: Mutex<HashSet<usize>>,
        pub published: Mutex<Vec<OutboundEvent>>,
    }

    impl ScriptedPublisher {
        pub fn published_ids(&self) -> Vec<String> {
            self.published
                .lock()
                .iter()
                .map(|e| e.payload_id().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for ScriptedPublisher {
        async fn connect(&self) -> Result<(), ProducerError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ProducerError::ConnectError("broker down".into()));
            }
            Ok(())
        }

        async fn publish(&self, event: &OutboundEvent) -> Result<DeliveryResult, ProducerError> {
            let attempt = self.publish_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_attempts.lock().contains(&attempt) {
                return Err(ProducerError::SendError {
                    topic: event.topic().to_string(),
                    message: "broker went away".into(),
                });
            }
            let mut published = self.published.lock();
            published.push(event.clone());
            Ok(DeliveryResult {
                topic: event.topic().to_string(),
                partition: 0,
                offset: published.len() as i64 - 1,
            })
        }
    }

    fn event(id: &str) -> OutboundEvent {
        OutboundEvent::new(
            "platform.upload.advisor",
            Some(id.to_string()),
            &serde_json::json!({ "payload_id": id }),
        )
        .unwrap()
    }

    fn producer_loop(
        publisher: Arc<ScriptedPublisher>,
        queue: Arc<ProduceQueue>,
        status: Arc<ConnectionStatus>,
    ) -> ProducerLoop {
        ProducerLoop::new(
            publisher,
            queue,
            status,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_producer_down() {
        let publisher = Arc::new(ScriptedPublisher::default());
        publisher.connect_failures.store(1, Ordering::SeqCst);
        let status = Arc::new(ConnectionStatus::new());
        let lp = producer_loop(publisher.clone(), Arc::new(ProduceQueue::new(10)), status.clone());

        assert!(!lp.connect().await);
        assert!(!status.producer_connected());

        assert!(lp.connect().await);
        assert!(status.producer_connected());
    }

    #[tokio::test]
    async fn test_drain_publishes_in_order() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let queue = Arc::new(ProduceQueue::new(10));
        let lp = producer_loop(publisher.clone(), queue.clone(), Arc::new(ConnectionStatus::new()));

        assert_eq!(lp.drain().await, DrainOutcome::Idle);

        for id in ["a", "b", "c"] {
            queue.enqueue(event(id));
        }
        assert_eq!(lp.drain().await, DrainOutcome::Drained(3));
        assert_eq!(publisher.published_ids(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_requeues_rest_of_batch() {
        let publisher = Arc::new(ScriptedPublisher::default());
        publisher.failing_attempts.lock().insert(1);
        let queue = Arc::new(ProduceQueue::new(10));
        let status = Arc::new(ConnectionStatus::new());
        let lp = producer_loop(publisher.clone(), queue.clone(), status.clone());
        assert!(lp.connect().await);

        for id in ["a", "b", "c"] {
            queue.enqueue(event(id));
        }

        assert_eq!(
            lp.drain().await,
            DrainOutcome::Disconnected { sent: 1, requeued: 2 }
        );
        assert!(!status.producer_connected());
        assert_eq!(queue.len(), 2);

        assert!(lp.connect().await);
        assert_eq!(lp.drain().await, DrainOutcome::Drained(2));
        assert_eq!(publisher.published_ids(), vec!["a", "b", "c"]);
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_handshake_waits_retry_interval() {
        let publisher = Arc::new(ScriptedPublisher::default());
        publisher.connect_failures.store(5, Ordering::SeqCst);
        let lp = Arc::new(ProducerLoop::new(
            publisher.clone(),
            Arc::new(ProduceQueue::new(10)),
            Arc::new(ConnectionStatus::new()),
            Duration::from_secs(30),
            Duration::from_millis(5),
        ));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let lp = lp.clone();
            let shutdown = shutdown.clone();
            async move { lp.run(shutdown).await }
        });

        settle().await;
        assert_eq!(publisher.connect_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(publisher.connect_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(publisher.connect_calls.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_recovers_from_disconnect() {
        let publisher = Arc::new(ScriptedPublisher::default());
        publisher.connect_failures.store(1, Ordering::SeqCst);
        publisher.failing_attempts.lock().insert(0);
        let queue = Arc::new(ProduceQueue::new(10));
        let status = Arc::new(ConnectionStatus::new());

        for id in ["a", "b", "c"] {
            queue.enqueue(event(id));
        }

        let lp = Arc::new(producer_loop(publisher.clone(), queue.clone(), status.clone()));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let lp = lp.clone();
            let shutdown = shutdown.clone();
            async move { lp.run(shutdown).await }
        });

        wait_for(|| publisher.published.lock().len() == 3).await;
        assert!(status.producer_connected());

        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(publisher.published_ids(), vec!["a", "b", "c"]);
        // one refused handshake, one initial connect, one reconnect after the send error
        assert_eq!(publisher.connect_calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
    }
}
