//! Tiered artifact storage.
//!
//! An artifact's tier is never recorded anywhere: it is whichever namespace
//! currently holds it. Uploads land in [`StorageTier::Quarantine`] and are
//! moved to [`StorageTier::Permanent`] or [`StorageTier::Rejected`] once a
//! validation verdict arrives.

pub mod local;
pub mod s3;

use crate::config::{StorageConfig, StorageDriver};
use crate::pool::{PoolError, WorkerPool};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use local::LocalDiskStorage;
pub use s3::S3TierStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageTier {
    Quarantine,
    Permanent,
    Rejected,
}

impl StorageTier {
    pub const ALL: [StorageTier; 3] = [
        StorageTier::Quarantine,
        StorageTier::Permanent,
        StorageTier::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Quarantine => "quarantine",
            StorageTier::Permanent => "permanent",
            StorageTier::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object {id} not found in {tier} storage")]
    NotFound { tier: StorageTier, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Default)]
struct ProgressState {
    percentage: AtomicU8,
    failed: AtomicBool,
}

/// Progress of a write that may still be running in the background.
///
/// Cloning shares the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    state: Arc<ProgressState>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for a write that already finished
    pub fn completed() -> Self {
        let handle = Self::new();
        handle.set_percentage(100);
        handle
    }

    pub fn set_percentage(&self, percentage: u8) {
        self.state
            .percentage
            .store(percentage.min(100), Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.state.failed.store(true, Ordering::Release);
    }

    pub fn percentage(&self) -> u8 {
        self.state.percentage.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.percentage() >= 100
    }

    pub fn has_failed(&self) -> bool {
        self.state.failed.load(Ordering::Acquire)
    }
}

/// Storage holding the three artifact tiers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TierStorage: Send + Sync {
    /// Start writing `file` into `tier` under `id`.
    ///
    /// Returns the artifact URL and a handle reporting when the write finished.
    async fn write(
        &self,
        file: &Path,
        tier: StorageTier,
        id: &str,
    ) -> Result<(String, ProgressHandle), StorageError>;

    /// Move the artifact `id` from one tier to another, returning its new URL
    async fn copy(
        &self,
        from: StorageTier,
        to: StorageTier,
        id: &str,
    ) -> Result<String, StorageError>;

    /// Whether the tier is reachable
    async fn up_check(&self, tier: StorageTier) -> bool;
}

/// Build the storage driver selected in configuration
pub async fn from_config(
    config: &StorageConfig,
    pool: WorkerPool,
    url_expiry: Duration,
) -> Result<Arc<dyn TierStorage>, StorageError> {
    let storage: Arc<dyn TierStorage> = match config.driver {
        StorageDriver::S3 => Arc::new(S3TierStorage::new(&config.s3, url_expiry, pool).await),
        StorageDriver::LocalDisk => {
            Arc::new(LocalDiskStorage::new(&config.localdisk.base_path, pool).await?)
        }
    };
    Ok(storage)
}

/// Sanitize an object id so it can be used as a single path component or key
pub(crate) fn sanitize_object_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
