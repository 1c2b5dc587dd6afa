//! Local-disk tier storage for development and testing.
//!
//! Each tier is a directory under the base path:
//! `{base_path}/{quarantine|permanent|rejected}/{id}`

use super::{sanitize_object_id, ProgressHandle, StorageError, StorageTier, TierStorage};
use crate::pool::WorkerPool;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct LocalDiskStorage {
    base_path: PathBuf,
    pool: WorkerPool,
}

impl LocalDiskStorage {
    /// Create the storage, making the tier directories if missing
    pub async fn new(base_path: impl Into<PathBuf>, pool: WorkerPool) -> Result<Self, StorageError> {
        let base_path = base_path.into();

        for tier in StorageTier::ALL {
            tokio::fs::create_dir_all(base_path.join(tier.as_str())).await?;
        }

        info!(base_path = %base_path.display(), "Local disk storage initialized");

        Ok(Self { base_path, pool })
    }

    pub fn tier_path(&self, tier: StorageTier) -> PathBuf {
        self.base_path.join(tier.as_str())
    }

    pub fn object_path(&self, tier: StorageTier, id: &str) -> PathBuf {
        self.tier_path(tier).join(sanitize_object_id(id))
    }

    fn url_for(path: &Path) -> String {
        format!("file://{}", path.display())
    }
}

#[async_trait]
impl TierStorage for LocalDiskStorage {
    #[instrument(skip(self, file), fields(tier = %tier))]
    async fn write(
        &self,
        file: &Path,
        tier: StorageTier,
        id: &str,
    ) -> Result<(String, ProgressHandle), StorageError> {
        let source = file.to_path_buf();
        let dest = self.object_path(tier, id);
        let target = dest.clone();

        let bytes = self
            .pool
            .run_blocking(move || std::fs::copy(&source, &target))
            .await??;

        debug!(path = %dest.display(), size_bytes = bytes, "Wrote object");

        Ok((Self::url_for(&dest), ProgressHandle::completed()))
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn copy(
        &self,
        from: StorageTier,
        to: StorageTier,
        id: &str,
    ) -> Result<String, StorageError> {
        let source = self.object_path(from, id);
        let dest = self.object_path(to, id);
        let target = dest.clone();

        let moved = self
            .pool
            .run_blocking(move || std::fs::rename(&source, &target))
            .await?;

        match moved {
            Ok(()) => Ok(Self::url_for(&dest)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                tier: from,
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn up_check(&self, tier: StorageTier) -> bool {
        tokio::fs::metadata(self.tier_path(tier))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}
