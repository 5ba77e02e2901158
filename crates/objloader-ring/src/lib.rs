//! Shared-memory transport between the loader and its persistence worker.
//!
//! [`SharedRingBuffer`] is a fixed-capacity circular byte region with an
//! atomically updated header. Exactly one [`RingProducer`] and one
//! [`RingConsumer`] attach to it for its whole lifetime. Messages are
//! stored as `[len: u32 LE][payload]` records that may wrap around the end
//! of the region; a record becomes visible to the consumer only when the
//! producer publishes it through the `used` counter.
//!
//! On top of the raw byte ring, [`MessageSender`] / [`MessageReceiver`]
//! carry typed [`WorkerMessage`]s framed by [`MessageCodec`].

pub mod buffer;
pub mod channel;
pub mod error;
pub mod message;

pub use buffer::{channel, RingConsumer, RingProducer, SharedRingBuffer, LEN_PREFIX};
pub use channel::{message_channel, MessageReceiver, MessageSender};
pub use error::{RingError, RingResult};
pub use message::{MessageCodec, WorkerMessage};
