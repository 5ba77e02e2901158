use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{RingError, RingResult};

/// Bytes used by the length prefix of every record.
pub const LEN_PREFIX: usize = 4;

/// Spins before the back-off starts yielding the thread.
const SPIN_LIMIT: u32 = 64;
/// Yields before the back-off starts sleeping.
const YIELD_LIMIT: u32 = 256;
const MAX_SLEEP: Duration = Duration::from_micros(500);

/// Fixed-capacity circular byte region shared by one producer and one
/// consumer.
///
/// Header layout:
///
/// ```text
/// head: offset of the next record to read   (written by the consumer)
/// tail: offset where the next record starts (written by the producer)
/// used: committed bytes; the only publication point between the two
/// ```
///
/// The data bytes are individually atomic so the region can be shared
/// without `unsafe`. Ordering comes from the release/acquire pair on
/// `used`: the producer writes bytes then release-adds to `used`, the
/// consumer acquire-loads `used` before reading and release-subtracts once
/// the bytes are copied out.
pub struct SharedRingBuffer {
    head: AtomicUsize,
    tail: AtomicUsize,
    used: AtomicUsize,
    producer_attached: AtomicBool,
    consumer_attached: AtomicBool,
    producer_closed: AtomicBool,
    enqueued_bytes: AtomicU64,
    dequeued_bytes: AtomicU64,
    data: Box<[AtomicU8]>,
}

impl SharedRingBuffer {
    /// Allocate a ring with `capacity` bytes of data region.
    pub fn new(capacity: usize) -> RingResult<Arc<Self>> {
        if capacity <= LEN_PREFIX || capacity > u32::MAX as usize {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let data = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        Ok(Arc::new(Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            producer_attached: AtomicBool::new(false),
            consumer_attached: AtomicBool::new(false),
            producer_closed: AtomicBool::new(false),
            enqueued_bytes: AtomicU64::new(0),
            dequeued_bytes: AtomicU64::new(0),
            data,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Committed bytes not yet consumed (record prefixes included).
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.used_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.used_bytes() == 0
    }

    /// Largest payload a single record can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity() - LEN_PREFIX
    }

    /// `true` once the producer handle has been dropped.
    pub fn is_producer_closed(&self) -> bool {
        self.producer_closed.load(Ordering::Acquire)
    }

    /// Total payload bytes committed by the producer.
    pub fn enqueued_bytes(&self) -> u64 {
        self.enqueued_bytes.load(Ordering::Relaxed)
    }

    /// Total payload bytes handed out by the consumer.
    pub fn dequeued_bytes(&self) -> u64 {
        self.dequeued_bytes.load(Ordering::Relaxed)
    }

    fn write_wrapping(&self, offset: usize, bytes: &[u8]) -> usize {
        let cap = self.capacity();
        let mut pos = offset;
        for b in bytes {
            self.data[pos].store(*b, Ordering::Relaxed);
            pos += 1;
            if pos == cap {
                pos = 0;
            }
        }
        pos
    }

    fn read_wrapping(&self, offset: usize, out: &mut [u8]) -> usize {
        let cap = self.capacity();
        let mut pos = offset;
        for b in out.iter_mut() {
            *b = self.data[pos].load(Ordering::Relaxed);
            pos += 1;
            if pos == cap {
                pos = 0;
            }
        }
        pos
    }
}

impl std::fmt::Debug for SharedRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRingBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used_bytes())
            .finish()
    }
}

/// Busy-wait back-off: spin, then yield, then short sleeps.
struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1 << self.step.min(6)) {
                std::hint::spin_loop();
            }
        } else if self.step < YIELD_LIMIT {
            thread::yield_now();
        } else {
            let shift = (self.step - YIELD_LIMIT).min(5);
            thread::sleep((Duration::from_micros(16) * (1 << shift)).min(MAX_SLEEP));
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Wait until `ready` holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    if ready() {
        return true;
    }
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new();
    loop {
        backoff.snooze();
        if ready() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
}

/// The single writing side of a [`SharedRingBuffer`].
#[derive(Debug)]
pub struct RingProducer {
    ring: Arc<SharedRingBuffer>,
}

impl RingProducer {
    /// Attach as the producer. Fails if a producer was ever attached.
    pub fn attach(ring: &Arc<SharedRingBuffer>) -> RingResult<Self> {
        ring.producer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RingError::RoleTaken("producer"))?;
        Ok(Self { ring: Arc::clone(ring) })
    }

    /// The backing memory, for handing to the consumer side at start-up.
    pub fn shared_buffer(&self) -> Arc<SharedRingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Append one record, waiting up to `timeout` for room.
    ///
    /// A [`RingError::Timeout`] leaves the ring untouched; the caller owns
    /// the bytes and decides whether to retry.
    pub fn enqueue(&mut self, bytes: &[u8], timeout: Duration) -> RingResult<()> {
        let ring = &self.ring;
        let record_len = LEN_PREFIX + bytes.len();
        if record_len > ring.capacity() {
            return Err(RingError::MessageTooLarge {
                size: bytes.len(),
                capacity: ring.capacity(),
            });
        }

        let cap = ring.capacity();
        if !wait_until(timeout, || cap - ring.used.load(Ordering::Acquire) >= record_len) {
            trace!(len = bytes.len(), "ring enqueue timed out");
            return Err(RingError::Timeout);
        }

        // Only this producer moves `tail`.
        let tail = ring.tail.load(Ordering::Relaxed);
        let pos = ring.write_wrapping(tail, &(bytes.len() as u32).to_le_bytes());
        let pos = ring.write_wrapping(pos, bytes);
        ring.tail.store(pos, Ordering::Relaxed);
        ring.used.fetch_add(record_len, Ordering::Release);
        ring.enqueued_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.ring.producer_closed.store(true, Ordering::Release);
    }
}

/// The single reading side of a [`SharedRingBuffer`].
#[derive(Debug)]
pub struct RingConsumer {
    ring: Arc<SharedRingBuffer>,
}

impl RingConsumer {
    /// Attach as the consumer. Fails if a consumer was ever attached.
    pub fn attach(ring: &Arc<SharedRingBuffer>) -> RingResult<Self> {
        ring.consumer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RingError::RoleTaken("consumer"))?;
        Ok(Self { ring: Arc::clone(ring) })
    }

    pub fn shared_buffer(&self) -> Arc<SharedRingBuffer> {
        Arc::clone(&self.ring)
    }

    /// Take up to `max_items` whole records, waiting up to `timeout` for the
    /// first one. Returns an empty vec when nothing arrived in time.
    pub fn dequeue(&mut self, max_items: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let ring = &self.ring;
        if max_items == 0 || !wait_until(timeout, || ring.used.load(Ordering::Acquire) > 0) {
            return Vec::new();
        }

        let mut available = ring.used.load(Ordering::Acquire);
        let mut out = Vec::new();
        // Only this consumer moves `head`.
        let mut head = ring.head.load(Ordering::Relaxed);
        while available > 0 && out.len() < max_items {
            let mut prefix = [0u8; LEN_PREFIX];
            let pos = ring.read_wrapping(head, &mut prefix);
            let len = u32::from_le_bytes(prefix) as usize;
            let mut payload = vec![0u8; len];
            head = ring.read_wrapping(pos, &mut payload);

            let record_len = LEN_PREFIX + len;
            ring.head.store(head, Ordering::Relaxed);
            ring.used.fetch_sub(record_len, Ordering::Release);
            ring.dequeued_bytes.fetch_add(len as u64, Ordering::Relaxed);
            available -= record_len;
            out.push(payload);
        }
        debug!(records = out.len(), "ring dequeue");
        out
    }

    /// `true` when the producer is gone and every record has been read.
    pub fn is_drained(&self) -> bool {
        self.ring.is_producer_closed() && self.ring.is_empty()
    }
}

/// Allocate a ring and attach both ends.
pub fn channel(capacity: usize) -> RingResult<(RingProducer, RingConsumer)> {
    let ring = SharedRingBuffer::new(capacity)?;
    let producer = RingProducer::attach(&ring)?;
    let consumer = RingConsumer::attach(&ring)?;
    Ok((producer, consumer))
}
