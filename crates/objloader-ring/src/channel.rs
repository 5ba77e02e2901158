use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::buffer::{channel, RingConsumer, RingProducer};
use crate::error::{RingError, RingResult};
use crate::message::{MessageCodec, WorkerMessage};

/// How long a single enqueue attempt waits before the sender re-checks its
/// overall deadline.
const RETRY_SLICE: Duration = Duration::from_millis(10);

/// Typed sending half layered over a [`RingProducer`].
#[derive(Debug)]
pub struct MessageSender {
    producer: RingProducer,
}

impl MessageSender {
    pub fn new(producer: RingProducer) -> Self {
        Self { producer }
    }

    /// Largest encoded frame the underlying ring can carry.
    pub fn max_frame(&self) -> usize {
        self.producer.shared_buffer().max_payload()
    }

    /// Single attempt: encode and enqueue, waiting up to `timeout` for room.
    pub fn send(&mut self, msg: &WorkerMessage, timeout: Duration) -> RingResult<()> {
        let frame = MessageCodec::encode(msg)?;
        self.producer.enqueue(&frame, timeout)
    }

    /// Keep retrying advisory timeouts until `deadline` has passed.
    pub fn send_within(&mut self, msg: &WorkerMessage, deadline: Duration) -> RingResult<()> {
        let frame = MessageCodec::encode(msg)?;
        let until = Instant::now() + deadline;
        let mut attempts = 0u32;
        loop {
            let slice = until.saturating_duration_since(Instant::now()).min(RETRY_SLICE);
            match self.producer.enqueue(&frame, slice) {
                Err(RingError::Timeout) if Instant::now() < until => {
                    attempts += 1;
                    if attempts % 100 == 0 {
                        debug!(msg = msg.type_name(), attempts, "ring full, still waiting");
                    }
                }
                other => return other,
            }
        }
    }
}

/// Typed receiving half layered over a [`RingConsumer`].
#[derive(Debug)]
pub struct MessageReceiver {
    consumer: RingConsumer,
}

impl MessageReceiver {
    pub fn new(consumer: RingConsumer) -> Self {
        Self { consumer }
    }

    /// Receive up to `max_items` messages. Frames that fail to decode are
    /// logged and skipped.
    pub fn recv(&mut self, max_items: usize, timeout: Duration) -> Vec<WorkerMessage> {
        self.consumer
            .dequeue(max_items, timeout)
            .into_iter()
            .filter_map(|frame| match MessageCodec::decode(&frame) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(error = %e, len = frame.len(), "dropping undecodable worker frame");
                    None
                }
            })
            .collect()
    }

    pub fn is_drained(&self) -> bool {
        self.consumer.is_drained()
    }
}

/// Allocate a ring of `capacity` bytes and wrap both ends.
pub fn message_channel(capacity: usize) -> RingResult<(MessageSender, MessageReceiver)> {
    let (producer, consumer) = channel(capacity)?;
    Ok((MessageSender::new(producer), MessageReceiver::new(consumer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_types::{Base, Item};
    use std::thread;

    #[test]
    fn typed_messages_flow_in_order() {
        let (mut tx, mut rx) = message_channel(1024).unwrap();
        tx.send(&WorkerMessage::SaveBatch(vec![Item::new(Base::new("a"))]), RETRY_SLICE)
            .unwrap();
        tx.send(&WorkerMessage::Flush { seq: 1 }, RETRY_SLICE).unwrap();
        tx.send(&WorkerMessage::Shutdown, RETRY_SLICE).unwrap();

        let msgs = rx.recv(10, RETRY_SLICE);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], WorkerMessage::SaveBatch(ref v) if v.len() == 1));
        assert_eq!(msgs[1], WorkerMessage::Flush { seq: 1 });
        assert_eq!(msgs[2], WorkerMessage::Shutdown);
    }

    #[test]
    fn oversize_frame_is_reported() {
        let (mut tx, _rx) = message_channel(64).unwrap();
        let items: Vec<Item> = (0..10).map(|i| Item::new(Base::new(format!("id-{i}")))).collect();
        let err = tx.send(&WorkerMessage::SaveBatch(items), RETRY_SLICE).unwrap_err();
        assert!(matches!(err, RingError::MessageTooLarge { .. }));
    }

    #[test]
    fn send_within_waits_for_consumer() {
        let (mut tx, mut rx) = message_channel(64).unwrap();
        // Fill the ring so the next send must wait for the reader.
        while tx.send(&WorkerMessage::Shutdown, Duration::ZERO).is_ok() {}

        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let mut seen = 0;
            while seen < 2 {
                seen += rx.recv(16, Duration::from_millis(50)).len();
            }
            rx
        });
        tx.send_within(&WorkerMessage::Flush { seq: 9 }, Duration::from_secs(5))
            .unwrap();
        let mut rx = reader.join().unwrap();
        drop(tx);
        let mut rest = Vec::new();
        while !rx.is_drained() {
            rest.extend(rx.recv(16, Duration::from_millis(10)));
        }
        assert_eq!(rest.last(), Some(&WorkerMessage::Flush { seq: 9 }));
    }
}
