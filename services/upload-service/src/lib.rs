//! Upload Service - archive ingestion gateway
//!
//! Accepts archive uploads over HTTP, stages them in quarantine storage and
//! announces them on Kafka for validation. Validation verdicts coming back
//! from the bus promote an archive to permanent storage (and announce it as
//! available) or move it to rejected storage.
//!
//! # Architecture
//!
//! ```text
//! HTTP upload -> UploadIngestor -> TierStorage (quarantine)
//!                      |
//!                      v
//!                ProduceQueue -> ProducerLoop -> Kafka -> validator
//!                      ^                                     |
//!                      |                                     v
//!              ValidationHandler <- ConsumerLoop <-------- Kafka
//!                      |
//!                      v
//!        TierStorage (quarantine -> permanent | rejected)
//! ```
//!
//! The two loops share nothing but the [`ProduceQueue`] and the
//! [`ConnectionStatus`] flags read by the status endpoint.

pub mod api;
pub mod config;
pub mod consumer;
pub mod identity;
pub mod ingest;
pub mod messages;
pub mod pool;
pub mod produce_queue;
pub mod producer;
pub mod status;
pub mod storage;
pub mod validation;

// Re-export main types
pub use api::{create_router, start_api_server, AppState};
pub use config::{Config, ConfigValidationError, KafkaConfig, StorageDriver};
pub use consumer::{ConsumerError, ConsumerLoop, InboundRecord, KafkaRecordSource, RecordSource};
pub use identity::{Identity, IdentityError};
pub use ingest::{IngestSettings, UploadIngestor, UploadRejection, UploadRequest};
pub use messages::{OutboundEvent, UploadAvailable, UploadReceived};
pub use pool::{PoolError, WorkerPool};
pub use produce_queue::ProduceQueue;
pub use producer::{EventPublisher, KafkaPublisher, ProducerError, ProducerLoop};
pub use status::ConnectionStatus;
pub use storage::{ProgressHandle, StorageError, StorageTier, TierStorage};
pub use validation::{ValidationHandler, ValidationVerdict, VerdictError, VerdictResult};
