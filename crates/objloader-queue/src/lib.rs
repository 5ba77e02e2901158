//! Queue primitives shared by the downloader and the cache.
//!
//! - [`Queue`]: fire-and-forget sink; stages hand results to each other
//!   through it without knowing who is on the other side.
//! - [`KeyedQueue`]: insertion-ordered, last-write-wins pending set.
//! - [`BatchingQueue`]: coalesces keyed values and hands them to a
//!   [`BatchProcessor`] when a batch fills up or its max-wait timer fires.

pub mod batching;
pub mod error;
pub mod keyed;
pub mod sink;

pub use batching::{BatchConfig, BatchProcessor, BatchingQueue};
pub use error::{QueueError, QueueResult};
pub use keyed::KeyedQueue;
pub use sink::{BufferQueue, FnQueue, Queue};
