//! Validation verdicts and the tier transitions they drive.

use crate::messages::{OutboundEvent, UploadAvailable};
use crate::produce_queue::ProduceQueue;
use crate::storage::{StorageTier, TierStorage};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Error, Debug)]
pub enum VerdictError {
    #[error("Unable to decode verdict as JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("payload_id or hash not in message")]
    MissingPayloadId,

    #[error("validation result not in message")]
    MissingResult,
}

/// Outcome reported by the external validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictResult {
    Success,
    Failure,
    Other(String),
}

impl VerdictResult {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "success" => VerdictResult::Success,
            "failure" => VerdictResult::Failure,
            other => VerdictResult::Other(other.to_string()),
        }
    }
}

/// A verdict with the legacy `hash` field already folded into `payload_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub payload_id: String,
    pub result: VerdictResult,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    payload_id: Option<String>,
    hash: Option<String>,
    validation: Option<String>,
}

impl ValidationVerdict {
    /// Parse a record from the validation topic
    pub fn from_slice(payload: &[u8]) -> Result<Self, VerdictError> {
        let raw: RawVerdict = serde_json::from_slice(payload)?;

        let payload_id = raw
            .payload_id
            .or(raw.hash)
            .ok_or(VerdictError::MissingPayloadId)?;
        let result = raw.validation.ok_or(VerdictError::MissingResult)?;

        Ok(Self {
            payload_id,
            result: VerdictResult::parse(&result),
        })
    }
}

/// What handling a verdict did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// Moved to permanent storage and announced as available
    Promoted { url: String },
    /// Moved to rejected storage
    Rejected,
    /// Unrecognized result, nothing done
    Ignored,
    /// The storage move failed; the verdict is not retried
    StorageFailed,
}

/// Moves artifacts between tiers according to validation verdicts
pub struct ValidationHandler {
    storage: Arc<dyn TierStorage>,
    queue: Arc<ProduceQueue>,
    available_topic: String,
}

impl ValidationHandler {
    pub fn new(
        storage: Arc<dyn TierStorage>,
        queue: Arc<ProduceQueue>,
        available_topic: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            queue,
            available_topic: available_topic.into(),
        }
    }

    #[instrument(skip(self, verdict), fields(payload_id = %verdict.payload_id))]
    pub async fn handle(&self, verdict: ValidationVerdict) -> VerdictOutcome {
        info!(result = ?verdict.result, "Processing validation verdict");
        metrics::counter!("consumer.verdicts.processed").increment(1);

        let target = match verdict.result {
            VerdictResult::Success => StorageTier::Permanent,
            VerdictResult::Failure => StorageTier::Rejected,
            VerdictResult::Other(ref result) => {
                info!(result = %result, "Unrecognized validation result");
                return VerdictOutcome::Ignored;
            }
        };

        let url = match self.move_artifact(&verdict.payload_id, target).await {
            Some(url) => url,
            None => return VerdictOutcome::StorageFailed,
        };

        if target == StorageTier::Rejected {
            info!("Payload rejected");
            return VerdictOutcome::Rejected;
        }

        let message = UploadAvailable {
            url: url.clone(),
            payload_id: verdict.payload_id.clone(),
        };
        match OutboundEvent::new(
            self.available_topic.clone(),
            Some(verdict.payload_id.clone()),
            &message,
        ) {
            Ok(event) => {
                self.queue.enqueue(event);
                info!(
                    url = %url,
                    queue_len = self.queue.len(),
                    "Payload available, announcement queued"
                );
            }
            Err(e) => error!(error = %e, "Failed to build availability event"),
        }

        VerdictOutcome::Promoted { url }
    }

    async fn move_artifact(&self, payload_id: &str, target: StorageTier) -> Option<String> {
        match self
            .storage
            .copy(StorageTier::Quarantine, target, payload_id)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                metrics::counter!("storage.copy.failed").increment(1);
                error!(error = %e, to = %target, "Failed to move payload out of quarantine");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockTierStorage, StorageError};
    use mockall::predicate::eq;

    fn handler(storage: MockTierStorage, queue: Arc<ProduceQueue>) -> ValidationHandler {
        ValidationHandler::new(Arc::new(storage), queue, "platform.upload.available")
    }

    #[test]
    fn test_parse_payload_id() {
        let verdict =
            ValidationVerdict::from_slice(br#"{"payload_id": "abc123", "validation": "success"}"#)
                .unwrap();
        assert_eq!(verdict.payload_id, "abc123");
        assert_eq!(verdict.result, VerdictResult::Success);
    }

    #[test]
    fn test_parse_legacy_hash() {
        let verdict =
            ValidationVerdict::from_slice(br#"{"hash": "abc123", "validation": "FAILURE"}"#)
                .unwrap();
        assert_eq!(verdict.payload_id, "abc123");
        assert_eq!(verdict.result, VerdictResult::Failure);
    }

    #[test]
    fn test_payload_id_wins_over_hash() {
        let verdict = ValidationVerdict::from_slice(
            br#"{"payload_id": "new", "hash": "old", "validation": "success"}"#,
        )
        .unwrap();
        assert_eq!(verdict.payload_id, "new");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ValidationVerdict::from_slice(b"not json"),
            Err(VerdictError::Malformed(_))
        ));
        assert!(matches!(
            ValidationVerdict::from_slice(br#"{"validation": "success"}"#),
            Err(VerdictError::MissingPayloadId)
        ));
        assert!(matches!(
            ValidationVerdict::from_slice(br#"{"payload_id": "abc123"}"#),
            Err(VerdictError::MissingResult)
        ));
    }

    #[test]
    fn test_unknown_result_is_kept() {
        let verdict =
            ValidationVerdict::from_slice(br#"{"payload_id": "abc123", "validation": "Maybe"}"#)
                .unwrap();
        assert_eq!(verdict.result, VerdictResult::Other("maybe".to_string()));
    }

    #[tokio::test]
    async fn test_success_promotes_and_announces() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_copy()
            .with(
                eq(StorageTier::Quarantine),
                eq(StorageTier::Permanent),
                eq("abc123"),
            )
            .times(1)
            .returning(|_, _, _| Ok("https://perm/abc123".to_string()));
        let queue = Arc::new(ProduceQueue::new(10));

        let outcome = handler(storage, queue.clone())
            .handle(ValidationVerdict {
                payload_id: "abc123".to_string(),
                result: VerdictResult::Success,
            })
            .await;

        assert_eq!(
            outcome,
            VerdictOutcome::Promoted {
                url: "https://perm/abc123".to_string()
            }
        );
        let events = queue.dequeue_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), "platform.upload.available");
        assert_eq!(events[0].payload_id(), Some("abc123"));
        assert_eq!(events[0].payload()["url"], "https://perm/abc123");
    }

    #[tokio::test]
    async fn test_failure_rejects_without_event() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_copy()
            .with(
                eq(StorageTier::Quarantine),
                eq(StorageTier::Rejected),
                eq("abc123"),
            )
            .times(1)
            .returning(|_, _, _| Ok("https://rejected/abc123".to_string()));
        let queue = Arc::new(ProduceQueue::new(10));

        let outcome = handler(storage, queue.clone())
            .handle(ValidationVerdict {
                payload_id: "abc123".to_string(),
                result: VerdictResult::Failure,
            })
            .await;

        assert_eq!(outcome, VerdictOutcome::Rejected);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_result_touches_nothing() {
        let mut storage = MockTierStorage::new();
        storage.expect_copy().never();
        let queue = Arc::new(ProduceQueue::new(10));

        let outcome = handler(storage, queue.clone())
            .handle(ValidationVerdict {
                payload_id: "abc123".to_string(),
                result: VerdictResult::Other("pending".to_string()),
            })
            .await;

        assert_eq!(outcome, VerdictOutcome::Ignored);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_copy_failure_is_terminal() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_copy()
            .times(1)
            .returning(|_, _, _| Err(StorageError::Backend("bucket unavailable".to_string())));
        let queue = Arc::new(ProduceQueue::new(10));

        let outcome = handler(storage, queue.clone())
            .handle(ValidationVerdict {
                payload_id: "abc123".to_string(),
                result: VerdictResult::Success,
            })
            .await;

        assert_eq!(outcome, VerdictOutcome::StorageFailed);
        assert!(queue.is_empty());
    }
}
