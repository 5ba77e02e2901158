use objloader_queue::QueueError;
use objloader_ring::RingError;
use objloader_store::StoreError;

/// Errors from cache setup and its persistence path.
///
/// Only [`Cache::new`](crate::Cache::new) returns these to callers. Once the
/// cache is running, errors are logged and turn the cache network-only.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker transport error: {0}")]
    Ring(#[from] RingError),

    #[error("write queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// The persistence worker thread could not be started.
    #[error("failed to spawn persistence worker: {0}")]
    WorkerSpawn(std::io::Error),

    /// The persistence worker is gone while writes were still being sent.
    #[error("persistence worker exited")]
    WorkerExited,

    /// A blocking store call panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
