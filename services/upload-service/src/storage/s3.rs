use super::{sanitize_object_id, ProgressHandle, StorageError, StorageTier, TierStorage};
use crate::config::S3Config;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

/// S3 tier storage, one bucket per tier
pub struct S3TierStorage {
    client: S3Client,
    config: S3Config,
    url_expiry: Duration,
    pool: WorkerPool,
}

impl S3TierStorage {
    /// Create a new S3 tier storage client
    pub async fn new(config: &S3Config, url_expiry: Duration, pool: WorkerPool) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            quarantine = %config.quarantine_bucket,
            permanent = %config.permanent_bucket,
            rejected = %config.rejected_bucket,
            region = %config.region,
            "S3 tier storage initialized"
        );

        Self {
            client,
            config: config.clone(),
            url_expiry,
            pool,
        }
    }

    pub fn bucket(&self, tier: StorageTier) -> &str {
        bucket_for(&self.config, tier)
    }

    /// Presigned GET URL handed to downstream services
    async fn presigned_url(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let presigning_config = PresigningConfig::expires_in(self.url_expiry)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

fn bucket_for(config: &S3Config, tier: StorageTier) -> &str {
    match tier {
        StorageTier::Quarantine => &config.quarantine_bucket,
        StorageTier::Permanent => &config.permanent_bucket,
        StorageTier::Rejected => &config.rejected_bucket,
    }
}

#[async_trait]
impl TierStorage for S3TierStorage {
    #[instrument(skip(self, file), fields(tier = %tier))]
    async fn write(
        &self,
        file: &Path,
        tier: StorageTier,
        id: &str,
    ) -> Result<(String, ProgressHandle), StorageError> {
        let key = sanitize_object_id(id);
        let bucket = self.bucket(tier).to_string();

        // Read up front so the staged file can be removed whatever happens to the put
        let body = self.pool.run(tokio::fs::read(file)).await??;
        let size_bytes = body.len();
        let url = self.presigned_url(&bucket, &key).await?;

        let progress = ProgressHandle::new();
        let reporter = progress.clone();
        let client = self.client.clone();
        let pool = self.pool.clone();

        debug!(bucket = %bucket, key = %key, size_bytes, "Uploading object to S3");

        tokio::spawn(async move {
            let put = client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .send();

            match pool.run(put).await {
                Ok(Ok(_)) => {
                    reporter.set_percentage(100);
                    debug!(bucket = %bucket, key = %key, "Object uploaded");
                }
                Ok(Err(e)) => {
                    reporter.mark_failed();
                    error!(bucket = %bucket, key = %key, error = %e, "Failed to upload object to S3");
                }
                Err(e) => {
                    reporter.mark_failed();
                    error!(bucket = %bucket, key = %key, error = %e, "Upload never started");
                }
            }
        });

        Ok((url, progress))
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn copy(
        &self,
        from: StorageTier,
        to: StorageTier,
        id: &str,
    ) -> Result<String, StorageError> {
        let key = sanitize_object_id(id);
        let source_bucket = self.bucket(from);
        let dest_bucket = self.bucket(to);

        self.pool
            .run(async {
                self.client
                    .copy_object()
                    .copy_source(format!("{source_bucket}/{key}"))
                    .bucket(dest_bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        if e.as_service_error().and_then(|se| se.code()) == Some("NoSuchKey") {
                            StorageError::NotFound {
                                tier: from,
                                id: id.to_string(),
                            }
                        } else {
                            StorageError::Backend(e.to_string())
                        }
                    })?;

                self.client
                    .delete_object()
                    .bucket(source_bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;

                Ok::<_, StorageError>(())
            })
            .await??;

        debug!(key = %key, "Object moved between tiers");

        self.presigned_url(dest_bucket, &key).await
    }

    async fn up_check(&self, tier: StorageTier) -> bool {
        let head = self.client.head_bucket().bucket(self.bucket(tier)).send();
        matches!(self.pool.run(head).await, Ok(Ok(_)))
    }
}
