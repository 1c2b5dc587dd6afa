//! Upload ingestion.
//!
//! An accepted upload is staged to a temporary file and answered right away.
//! A detached task then writes it into quarantine, waits for the write to
//! finish, removes the staged file and announces the upload on the bus.
//! Nothing is announced for an upload whose write failed or timed out.

use crate::config::Config;
use crate::identity::Identity;
use crate::messages::{OutboundEvent, UploadReceived};
use crate::pool::WorkerPool;
use crate::produce_queue::ProduceQueue;
use crate::storage::{StorageTier, TierStorage};
use bytes::Bytes;
use regex::Regex;
use std::io::Write;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

static CONTENT_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^application/vnd\.redhat\.([a-z0-9-]+)\.([a-z0-9-]+)\+(tgz|zip)$")
        .expect("content type pattern is valid")
});

/// Why an upload was turned away
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadRejection {
    #[error("Upload field not found")]
    UploadFieldMissing,

    #[error("No payload_id assigned. Upload Failed")]
    MissingPayloadId,

    #[error("Content-Length header required")]
    MissingContentLength,

    #[error("Payload too large: {size}. Should not exceed {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Unsupported Media Type")]
    UnsupportedMediaType,

    #[error("Failed to stage upload: {0}")]
    Staging(String),
}

impl UploadRejection {
    pub fn status_code(&self) -> u16 {
        match self {
            UploadRejection::UploadFieldMissing | UploadRejection::UnsupportedMediaType => 415,
            UploadRejection::MissingPayloadId | UploadRejection::MissingContentLength => 400,
            UploadRejection::TooLarge { .. } => 413,
            UploadRejection::Staging(_) => 500,
        }
    }

    /// Stable machine-readable code for error bodies
    pub fn code(&self) -> &'static str {
        match self {
            UploadRejection::UploadFieldMissing => "UPLOAD_FIELD_MISSING",
            UploadRejection::MissingPayloadId => "MISSING_PAYLOAD_ID",
            UploadRejection::MissingContentLength => "MISSING_CONTENT_LENGTH",
            UploadRejection::TooLarge { .. } => "PAYLOAD_TOO_LARGE",
            UploadRejection::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
            UploadRejection::Staging(_) => "STAGING_FAILED",
        }
    }
}

/// The `upload` part of the multipart body
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub content_type: String,
    pub body: Bytes,
}

/// Everything the ingestion path needs from an HTTP upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub content_length: Option<u64>,
    pub payload_id: Option<String>,
    pub tracking_id: Option<String>,
    pub identity_header: Option<String>,
    pub file: Option<UploadedFile>,
}

/// An upload that passed every check
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub payload_id: String,
    pub tracking_id: String,
    pub size: u64,
    pub service: String,
    pub body: Bytes,
}

/// Reject a declared size before any of the body is read
pub fn check_declared_size(content_length: Option<u64>, max_length: u64) -> Result<(), UploadRejection> {
    match content_length {
        Some(size) if size >= max_length => Err(UploadRejection::TooLarge {
            size,
            max: max_length,
        }),
        _ => Ok(()),
    }
}

/// Service name encoded in an archive content type, e.g. `advisor` in
/// `application/vnd.redhat.advisor.payload+tgz`
pub fn service_from_content_type(content_type: &str) -> Option<String> {
    CONTENT_TYPE
        .captures(content_type)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Run the request checks in order: upload field, payload id, size, content type
pub fn validate_upload(
    request: UploadRequest,
    max_length: u64,
) -> Result<ValidatedUpload, UploadRejection> {
    let file = request.file.ok_or(UploadRejection::UploadFieldMissing)?;
    let payload_id = request
        .payload_id
        .filter(|id| !id.is_empty())
        .ok_or(UploadRejection::MissingPayloadId)?;

    let size = request
        .content_length
        .ok_or(UploadRejection::MissingContentLength)?;
    check_declared_size(Some(size), max_length)?;

    let service = service_from_content_type(&file.content_type)
        .ok_or(UploadRejection::UnsupportedMediaType)?;

    Ok(ValidatedUpload {
        payload_id,
        tracking_id: request.tracking_id.unwrap_or_else(|| "null".to_string()),
        size,
        service,
        body: file.body,
    })
}

/// Ingestion tuning taken from configuration
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub topic_prefix: String,
    pub max_length: u64,
    pub upload_timeout: Duration,
    pub poll_interval: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topic_prefix: config.kafka.topic_prefix.clone(),
            max_length: config.api.max_length,
            upload_timeout: config.storage_upload_timeout(),
            poll_interval: config.progress_poll_interval(),
        }
    }
}

/// A staged upload waiting for its quarantine write
#[derive(Debug)]
pub struct StagedUpload {
    pub path: TempPath,
    pub payload_id: String,
    pub tracking_id: String,
    pub size: u64,
    pub service: String,
    pub account: Option<(String, String)>,
}

/// Stages uploads and drives them into quarantine
pub struct UploadIngestor {
    storage: Arc<dyn TierStorage>,
    queue: Arc<ProduceQueue>,
    pool: WorkerPool,
    settings: IngestSettings,
}

impl UploadIngestor {
    pub fn new(
        storage: Arc<dyn TierStorage>,
        queue: Arc<ProduceQueue>,
        pool: WorkerPool,
        settings: IngestSettings,
    ) -> Self {
        Self {
            storage,
            queue,
            pool,
            settings,
        }
    }

    pub fn max_length(&self) -> u64 {
        self.settings.max_length
    }

    /// Validate and stage an upload, then hand it to a detached task.
    ///
    /// Returns the payload id once the body is staged; the quarantine write
    /// and the announcement happen after this returns.
    pub async fn accept(self: &Arc<Self>, request: UploadRequest) -> Result<String, UploadRejection> {
        let identity_header = request.identity_header.clone();
        let upload = validate_upload(request, self.settings.max_length)?;

        let account = identity_header.and_then(|header| match Identity::from_header(&header) {
            Ok(identity) => Some(identity.into_account()),
            Err(e) => {
                warn!(
                    payload_id = %upload.payload_id,
                    error = %e,
                    "Ignoring unreadable identity header"
                );
                None
            }
        });

        let path = self.stage(upload.body).await?;
        let payload_id = upload.payload_id;

        let staged = StagedUpload {
            path,
            payload_id: payload_id.clone(),
            tracking_id: upload.tracking_id,
            size: upload.size,
            service: upload.service,
            account,
        };

        let ingestor = Arc::clone(self);
        tokio::spawn(async move {
            ingestor.process_upload(staged).await;
        });

        Ok(payload_id)
    }

    /// Write the body to a temporary file on the worker pool
    pub async fn stage(&self, body: Bytes) -> Result<TempPath, UploadRejection> {
        self.pool
            .run_blocking(move || -> std::io::Result<TempPath> {
                let mut file = NamedTempFile::new()?;
                file.write_all(&body)?;
                file.flush()?;
                Ok(file.into_temp_path())
            })
            .await
            .map_err(|e| UploadRejection::Staging(e.to_string()))?
            .map_err(|e| UploadRejection::Staging(e.to_string()))
    }

    /// Write a staged upload into quarantine and announce it.
    ///
    /// The staged file is removed whatever the outcome. Returns the
    /// quarantine URL when the upload was announced.
    #[instrument(skip(self, staged), fields(payload_id = %staged.payload_id, tracking_id = %staged.tracking_id))]
    pub async fn process_upload(&self, staged: StagedUpload) -> Option<String> {
        let StagedUpload {
            path,
            payload_id,
            tracking_id: _,
            size,
            service,
            account,
        } = staged;

        info!("Attempting upload");
        let started = Instant::now();
        let url = self.write_to_quarantine(&path, &payload_id).await;

        match self.pool.run_blocking(move || path.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to remove staged upload"),
            Err(e) => warn!(error = %e, "Failed to remove staged upload"),
        }

        let Some(url) = url else {
            metrics::counter!("upload.storage.failed").increment(1);
            error!(
                timeout_secs = self.settings.upload_timeout.as_secs(),
                "Upload failed or timed out"
            );
            return None;
        };

        metrics::counter!("upload.storage.succeeded").increment(1);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            url = %url,
            "Uploaded"
        );

        let topic = format!("{}{}", self.settings.topic_prefix, service);
        let message = UploadReceived::new(account, payload_id.clone(), size, service, url.clone());
        match OutboundEvent::new(topic, Some(payload_id), &message) {
            Ok(event) => {
                self.queue.enqueue(event);
                info!(queue_len = self.queue.len(), "Data put on produce queue");
                Some(url)
            }
            Err(e) => {
                error!(error = %e, "Failed to build received event");
                None
            }
        }
    }

    async fn write_to_quarantine(&self, path: &TempPath, payload_id: &str) -> Option<String> {
        let (url, progress) = match self
            .storage
            .write(path, StorageTier::Quarantine, payload_id)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "Storage write failed");
                return None;
            }
        };

        let deadline = tokio::time::Instant::now() + self.settings.upload_timeout;
        loop {
            if progress.is_complete() {
                return Some(url);
            }
            if progress.has_failed() {
                return None;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(percentage = progress.percentage(), "Gave up waiting on storage write");
                return None;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockTierStorage, ProgressHandle, StorageError};
    use mockall::predicate::eq;

    const MAX: u64 = 1000;

    fn request(content_type: &str, size: u64, payload_id: Option<&str>) -> UploadRequest {
        UploadRequest {
            content_length: Some(size),
            payload_id: payload_id.map(str::to_string),
            tracking_id: None,
            identity_header: None,
            file: Some(UploadedFile {
                content_type: content_type.to_string(),
                body: Bytes::from(vec![0u8; size as usize]),
            }),
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            topic_prefix: "platform.upload.".to_string(),
            max_length: MAX,
            upload_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn ingestor(storage: MockTierStorage, queue: Arc<ProduceQueue>) -> Arc<UploadIngestor> {
        Arc::new(UploadIngestor::new(
            Arc::new(storage),
            queue,
            WorkerPool::new(4),
            settings(),
        ))
    }

    async fn staged(ingestor: &UploadIngestor, payload_id: &str) -> StagedUpload {
        StagedUpload {
            path: ingestor.stage(Bytes::from_static(b"archive")).await.unwrap(),
            payload_id: payload_id.to_string(),
            tracking_id: "null".to_string(),
            size: 7,
            service: "testsvc".to_string(),
            account: None,
        }
    }

    #[test]
    fn test_content_type_pattern_captures_all_parts() {
        let caps = CONTENT_TYPE
            .captures("application/vnd.redhat.advisor.payload+zip")
            .unwrap();
        assert_eq!(&caps[1], "advisor");
        assert_eq!(&caps[2], "payload");
        assert_eq!(&caps[3], "zip");
    }

    #[test]
    fn test_service_from_content_type() {
        assert_eq!(
            service_from_content_type("application/vnd.redhat.advisor.payload+tgz").as_deref(),
            Some("advisor")
        );
        assert_eq!(
            service_from_content_type("application/vnd.redhat.demo.testsvc+zip").as_deref(),
            Some("demo")
        );
        for bad in [
            "application/json",
            "vnd.redhat.demo.testsvc+tgz",
            "application/vnd.redhat.advisor.payload+tar",
            "application/vnd.redhat.Advisor.payload+tgz",
            "application/vnd.redhat.advisor+tgz",
        ] {
            assert_eq!(service_from_content_type(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_oversize_is_rejected() {
        for size in [MAX, MAX + 1, MAX * 10] {
            let err = validate_upload(
                request("application/vnd.redhat.advisor.payload+tgz", size, Some("abc123")),
                MAX,
            )
            .unwrap_err();
            assert_eq!(err, UploadRejection::TooLarge { size, max: MAX });
            assert_eq!(err.status_code(), 413);
        }
        assert!(check_declared_size(Some(MAX - 1), MAX).is_ok());
        assert!(check_declared_size(None, MAX).is_ok());
    }

    #[test]
    fn test_bad_content_type_is_rejected() {
        let err = validate_upload(request("application/zip", 100, Some("abc123")), MAX).unwrap_err();
        assert_eq!(err, UploadRejection::UnsupportedMediaType);
        assert_eq!(err.status_code(), 415);
    }

    #[test]
    fn test_missing_payload_id_wins_over_other_checks() {
        let err = validate_upload(request("application/zip", MAX * 2, None), MAX).unwrap_err();
        assert_eq!(err, UploadRejection::MissingPayloadId);
        assert_eq!(err.status_code(), 400);

        let err = validate_upload(request("application/zip", 10, Some("")), MAX).unwrap_err();
        assert_eq!(err, UploadRejection::MissingPayloadId);
    }

    #[test]
    fn test_missing_upload_field_is_checked_first() {
        let err = validate_upload(UploadRequest::default(), MAX).unwrap_err();
        assert_eq!(err, UploadRejection::UploadFieldMissing);
        assert_eq!(err.status_code(), 415);
        assert_eq!(err.to_string(), "Upload field not found");
    }

    #[test]
    fn test_valid_upload() {
        let mut req = request("application/vnd.redhat.demo.testsvc+tgz", 100, Some("abc123"));
        req.tracking_id = Some("track-1".to_string());
        let upload = validate_upload(req, MAX).unwrap();

        assert_eq!(upload.payload_id, "abc123");
        assert_eq!(upload.tracking_id, "track-1");
        assert_eq!(upload.size, 100);
        assert_eq!(upload.service, "demo");
    }

    #[tokio::test]
    async fn test_rejected_upload_never_touches_storage() {
        let mut storage = MockTierStorage::new();
        storage.expect_write().never();
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let err = ingestor
            .accept(request("application/vnd.redhat.demo.testsvc+tgz", MAX, Some("abc123")))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadRejection::TooLarge { .. }));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_accepted_upload_is_announced_once() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_write()
            .withf(|_, tier, id| *tier == StorageTier::Quarantine && id == "abc123")
            .times(1)
            .returning(|_, _, _| {
                Ok((
                    "https://quarantine/abc123".to_string(),
                    ProgressHandle::completed(),
                ))
            });
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let payload_id = ingestor
            .accept(request("application/vnd.redhat.testsvc.payload+tgz", 100, Some("abc123")))
            .await
            .unwrap();
        assert_eq!(payload_id, "abc123");

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload not announced in time");

        let events = queue.dequeue_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), "platform.upload.testsvc");
        assert_eq!(events[0].payload_id(), Some("abc123"));
        assert_eq!(events[0].payload()["hash"], "abc123");
        assert_eq!(events[0].payload()["size"], 100);
        assert_eq!(events[0].payload()["rh_account"], "000001");
    }

    #[tokio::test]
    async fn test_identity_header_sets_account() {
        use base64::Engine;

        let mut storage = MockTierStorage::new();
        storage
            .expect_write()
            .returning(|_, _, _| Ok(("https://q/abc123".to_string(), ProgressHandle::completed())));
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let mut req = request("application/vnd.redhat.testsvc.payload+tgz", 100, Some("abc123"));
        req.identity_header = Some(base64::engine::general_purpose::STANDARD.encode(
            r#"{"identity": {"account_number": "540155", "org_id": "1979710"}}"#,
        ));
        ingestor.accept(req).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload not announced in time");

        let events = queue.dequeue_all();
        assert_eq!(events[0].payload()["rh_account"], "540155");
        assert_eq!(events[0].payload()["principal"], "1979710");
    }

    #[tokio::test]
    async fn test_failed_write_is_not_announced() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_write()
            .with(
                mockall::predicate::always(),
                eq(StorageTier::Quarantine),
                eq("abc123"),
            )
            .times(1)
            .returning(|_, _, _| Err(StorageError::Backend("bucket unavailable".to_string())));
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let staged = staged(&ingestor, "abc123").await;
        let path = staged.path.to_path_buf();
        assert!(path.exists());

        assert_eq!(ingestor.process_upload(staged).await, None);
        assert!(queue.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let mut storage = MockTierStorage::new();
        storage
            .expect_write()
            .returning(|_, _, _| Ok(("https://q/abc123".to_string(), ProgressHandle::new())));
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let staged = staged(&ingestor, "abc123").await;
        let path = staged.path.to_path_buf();

        assert_eq!(ingestor.process_upload(staged).await, None);
        assert!(queue.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_background_write_is_awaited() {
        let mut storage = MockTierStorage::new();
        storage.expect_write().returning(|_, _, _| {
            let progress = ProgressHandle::new();
            let reporter = progress.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                reporter.set_percentage(100);
            });
            Ok(("https://q/abc123".to_string(), progress))
        });
        let queue = Arc::new(ProduceQueue::new(10));
        let ingestor = ingestor(storage, queue.clone());

        let staged = staged(&ingestor, "abc123").await;
        assert_eq!(
            ingestor.process_upload(staged).await.as_deref(),
            Some("https://q/abc123")
        );
        assert_eq!(queue.len(), 1);
    }
}
