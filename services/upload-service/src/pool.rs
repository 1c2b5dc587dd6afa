//! Bounded pool for blocking and storage work.
//!
//! File I/O and storage calls are run through the pool so that at most
//! `size` of them are in flight, no matter how many uploads arrive at once.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Blocking task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers not currently busy
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure on a pool worker
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| PoolError::Join(e.to_string()))
    }

    /// Run an async operation while holding a pool worker
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, PoolError>
    where
        F: Future,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;

        Ok(fut.await)
    }
}
