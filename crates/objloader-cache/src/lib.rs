//! Persistent cache of resolved Items.
//!
//! The cache is an optimization only: a miss falls back to the network, and
//! any storage failure degrades the cache to network-only mode instead of
//! failing the load. Writes are coalesced by a
//! [`BatchingQueue`](objloader_queue::BatchingQueue) and, by default, handed
//! to a dedicated persistence thread over a shared-memory ring buffer so the
//! async side never blocks on storage I/O.

pub mod cache;
pub mod config;
pub mod error;
mod worker;

pub use cache::Cache;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
