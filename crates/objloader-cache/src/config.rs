use std::time::Duration;

use objloader_queue::BatchConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Cache tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Window for coalescing writes into `put_batch` calls.
    pub write_batch: BatchConfig,
    /// Persist on a dedicated worker thread fed through a ring buffer.
    /// When off, batches are stored from the blocking pool instead.
    pub offload_writes: bool,
    /// Byte capacity of each worker ring.
    pub ring_capacity_bytes: usize,
    /// How long one enqueue attempt waits for ring space before retrying.
    pub enqueue_timeout_ms: u64,
    /// Upper bound on the final flush handshake with the worker.
    pub shutdown_timeout_ms: u64,
    /// Ids per `get_many` call.
    pub max_read_batch: usize,
}

impl CacheConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> CacheResult<()> {
        self.write_batch.validate()?;
        if self.max_read_batch == 0 {
            return Err(CacheError::InvalidConfig("max_read_batch must be positive".into()));
        }
        if self.enqueue_timeout_ms == 0 {
            return Err(CacheError::InvalidConfig("enqueue_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_batch: BatchConfig::new(1000, 200),
            offload_writes: true,
            ring_capacity_bytes: 16 * 1024,
            enqueue_timeout_ms: 100,
            shutdown_timeout_ms: 30_000,
            max_read_batch: 500,
        }
    }
}
