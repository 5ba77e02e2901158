use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use objloader_ring::{message_channel, MessageReceiver, MessageSender, RingError, WorkerMessage};
use objloader_store::ObjectStore;
use objloader_types::Item;
use tracing::{debug, error, trace, warn};

use crate::error::{CacheError, CacheResult};

const WORKER_POLL: Duration = Duration::from_millis(50);
const WORKER_RECV_MAX: usize = 16;
const REPLY_DEADLINE: Duration = Duration::from_secs(5);
const FINAL_FLUSH_SEQ: u64 = 1;

/// Counters and flags shared by the async side and the persistence worker.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    degraded: AtomicBool,
    /// Items handed to the write path and not yet stored or dropped.
    in_flight: AtomicUsize,
    stored: AtomicU64,
    worker_alive: AtomicBool,
}

impl CacheState {
    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Switch to network-only mode. Logged once.
    pub(crate) fn degrade(&self, reason: &dyn Display) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %reason, "cache degraded, continuing network-only");
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn begin(&self, n: usize) {
        self.in_flight.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn settle(&self, n: usize) {
        self.in_flight.fetch_sub(n, Ordering::AcqRel);
    }

    pub(crate) fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub(crate) fn worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::Acquire)
    }
}

/// Store one batch, degrading on failure. Always settles the batch.
pub(crate) fn persist(store: &dyn ObjectStore, state: &CacheState, items: &[Item]) {
    if state.is_degraded() {
        trace!(items = items.len(), "cache degraded, batch dropped");
    } else {
        match store.put_batch(items) {
            Ok(stored) => {
                state.stored.fetch_add(stored as u64, Ordering::Relaxed);
                trace!(offered = items.len(), stored, "batch persisted");
            }
            Err(e) => state.degrade(&e),
        }
    }
    state.settle(items.len());
}

/// Clears `worker_alive` when the worker exits, including by panic.
struct AliveGuard(Arc<CacheState>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.worker_alive.store(false, Ordering::Release);
    }
}

/// Owner side of the persistence thread.
///
/// Two rings connect the sides: the requests ring carries `SaveBatch`,
/// `Flush` and `Shutdown` to the worker, the replies ring carries `Flushed`
/// back.
pub(crate) struct PersistenceWorker {
    thread: JoinHandle<()>,
    sender: Arc<Mutex<MessageSender>>,
    replies: MessageReceiver,
    state: Arc<CacheState>,
}

impl PersistenceWorker {
    pub(crate) fn spawn(
        capacity: usize,
        store: Arc<dyn ObjectStore>,
        state: Arc<CacheState>,
    ) -> CacheResult<Self> {
        let (sender, requests) = message_channel(capacity)?;
        let (reply_sender, replies) = message_channel(capacity)?;

        state.worker_alive.store(true, Ordering::Release);
        let guard = AliveGuard(Arc::clone(&state));
        let thread = thread::Builder::new()
            .name("objloader-cache-worker".into())
            .spawn(move || run(requests, reply_sender, store.as_ref(), &guard.0))
            .map_err(|e| {
                state.worker_alive.store(false, Ordering::Release);
                CacheError::WorkerSpawn(e)
            })?;

        Ok(Self {
            thread,
            sender: Arc::new(Mutex::new(sender)),
            replies,
            state,
        })
    }

    pub(crate) fn sender(&self) -> Arc<Mutex<MessageSender>> {
        Arc::clone(&self.sender)
    }

    /// Blocking: wait for every earlier batch to be stored, then stop the
    /// thread. Gives up after `deadline` and leaves the thread detached.
    pub(crate) fn shutdown(mut self, deadline: Duration) {
        let until = Instant::now() + deadline;
        if !self.state.worker_alive() {
            debug!("cache worker already stopped");
            return;
        }

        let sender = Arc::clone(&self.sender);
        let shutdown_sent = {
            let mut sender = sender.lock().expect("worker sender poisoned");
            match sender.send_within(&WorkerMessage::Flush { seq: FINAL_FLUSH_SEQ }, deadline) {
                Ok(()) => {
                    if let Some(stored) = self.await_flushed(FINAL_FLUSH_SEQ, until) {
                        debug!(stored, "cache worker flushed");
                    }
                }
                Err(e) => warn!(error = %e, "could not send flush to cache worker"),
            }
            let remaining = until.saturating_duration_since(Instant::now());
            match sender.send_within(&WorkerMessage::Shutdown, remaining) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "could not send shutdown to cache worker");
                    false
                }
            }
        };

        if shutdown_sent && self.thread.join().is_err() {
            error!("cache worker panicked");
        }
    }

    fn await_flushed(&mut self, seq: u64, until: Instant) -> Option<u64> {
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(seq, "timed out waiting for cache worker flush");
                return None;
            }
            for msg in self.replies.recv(WORKER_RECV_MAX, remaining.min(WORKER_POLL)) {
                match msg {
                    WorkerMessage::Flushed { seq: s, stored } if s == seq => return Some(stored),
                    other => trace!(msg = other.type_name(), "ignoring stale worker reply"),
                }
            }
            if !self.state.worker_alive() && self.replies.is_drained() {
                warn!(seq, "cache worker exited before flushing");
                return None;
            }
        }
    }
}

/// Worker thread body.
fn run(
    mut requests: MessageReceiver,
    mut replies: MessageSender,
    store: &dyn ObjectStore,
    state: &CacheState,
) {
    debug!("cache worker started");
    loop {
        let batch = requests.recv(WORKER_RECV_MAX, WORKER_POLL);
        if batch.is_empty() {
            if requests.is_drained() {
                debug!("cache worker ring closed");
                return;
            }
            continue;
        }
        for msg in batch {
            match msg {
                WorkerMessage::SaveBatch(items) => persist(store, state, &items),
                WorkerMessage::Flush { seq } => {
                    let reply = WorkerMessage::Flushed {
                        seq,
                        stored: state.stored(),
                    };
                    if let Err(e) = replies.send_within(&reply, REPLY_DEADLINE) {
                        warn!(seq, error = %e, "failed to acknowledge flush");
                    }
                }
                WorkerMessage::Shutdown => {
                    debug!(stored = state.stored(), "cache worker stopping");
                    return;
                }
                other => warn!(msg = other.type_name(), "unexpected message on cache worker ring"),
            }
        }
    }
}

/// Hand one batch to the worker. Batches that do not fit in the ring are
/// split in halves; a single item that still does not fit is not cached.
/// Blocks the calling thread while the ring is full.
pub(crate) fn hand_off(
    sender: &Mutex<MessageSender>,
    items: Vec<Item>,
    attempt: Duration,
    state: &CacheState,
) {
    let mut sender = sender.lock().expect("worker sender poisoned");
    let mut chunks = vec![items];
    while let Some(chunk) = chunks.pop() {
        let n = chunk.len();
        if state.is_degraded() {
            let dropped = n + chunks.iter().map(Vec::len).sum::<usize>();
            trace!(items = dropped, "cache degraded, batch dropped");
            state.settle(dropped);
            return;
        }
        let msg = WorkerMessage::SaveBatch(chunk);
        match send_retrying(&mut sender, &msg, attempt, state) {
            Ok(()) => {}
            Err(CacheError::Ring(RingError::MessageTooLarge { size, capacity })) => {
                let WorkerMessage::SaveBatch(mut chunk) = msg else {
                    continue;
                };
                if n == 1 {
                    warn!(
                        id = %chunk[0].base_id,
                        size,
                        capacity,
                        "item exceeds worker ring capacity, not cached"
                    );
                    state.settle(1);
                    continue;
                }
                let tail = chunk.split_off(n / 2);
                chunks.push(tail);
                chunks.push(chunk);
            }
            Err(e) => {
                state.degrade(&e);
                state.settle(n + chunks.iter().map(Vec::len).sum::<usize>());
                return;
            }
        }
    }
}

/// Ring timeouts are flow control: retry while the worker is alive.
fn send_retrying(
    sender: &mut MessageSender,
    msg: &WorkerMessage,
    attempt: Duration,
    state: &CacheState,
) -> CacheResult<()> {
    let mut retries = 0u32;
    loop {
        match sender.send(msg, attempt) {
            Ok(()) => return Ok(()),
            Err(RingError::Timeout) => {
                if !state.worker_alive() {
                    return Err(CacheError::WorkerExited);
                }
                retries += 1;
                if retries % 50 == 0 {
                    debug!(retries, "cache worker ring full, retrying");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_store::InMemoryObjectStore;
    use objloader_types::{Base, BaseId};
    use serde_json::json;

    fn item(id: &str, payload: usize) -> Item {
        Item::new(Base::new(id).with_field("data", json!("x".repeat(payload))))
    }

    fn spawn(capacity: usize) -> (PersistenceWorker, Arc<InMemoryObjectStore>, Arc<CacheState>) {
        let store = Arc::new(InMemoryObjectStore::new());
        let state = Arc::new(CacheState::default());
        let worker = PersistenceWorker::spawn(capacity, store.clone(), state.clone()).unwrap();
        (worker, store, state)
    }

    #[test]
    fn worker_persists_and_acknowledges() {
        let (worker, store, state) = spawn(4096);
        let items: Vec<Item> = (0..10).map(|i| item(&format!("id-{i}"), 8)).collect();
        state.begin(items.len());
        hand_off(&worker.sender(), items, Duration::from_millis(10), &state);
        worker.shutdown(Duration::from_secs(5));

        assert_eq!(store.len(), 10);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(state.stored(), 10);
        assert!(!state.worker_alive());
    }

    #[test]
    fn oversized_batches_are_split() {
        let (worker, store, state) = spawn(1024);
        // Each item is ~250 bytes encoded; the whole batch cannot fit at once.
        let items: Vec<Item> = (0..12).map(|i| item(&format!("big-{i}"), 200)).collect();
        state.begin(items.len());
        hand_off(&worker.sender(), items, Duration::from_millis(10), &state);
        worker.shutdown(Duration::from_secs(5));

        assert_eq!(store.len(), 12);
        assert_eq!(state.in_flight(), 0);
        assert!(!state.is_degraded());
    }

    #[test]
    fn single_item_larger_than_ring_is_skipped() {
        let (worker, store, state) = spawn(256);
        let items = vec![item("small", 4), item("huge", 4096)];
        state.begin(items.len());
        hand_off(&worker.sender(), items, Duration::from_millis(10), &state);
        worker.shutdown(Duration::from_secs(5));

        assert!(store.get(&BaseId::new("small")).unwrap().is_some());
        assert!(store.get(&BaseId::new("huge")).unwrap().is_none());
        assert_eq!(state.in_flight(), 0);
        assert!(!state.is_degraded());
    }

    #[test]
    fn degrade_is_sticky_and_drops_writes() {
        let (worker, store, state) = spawn(4096);
        state.degrade(&"disk full");
        state.begin(1);
        hand_off(&worker.sender(), vec![item("a", 1)], Duration::from_millis(10), &state);
        worker.shutdown(Duration::from_secs(5));

        assert!(state.is_degraded());
        assert!(store.is_empty());
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn worker_exits_when_sender_dropped() {
        let (worker, _store, state) = spawn(512);
        let PersistenceWorker { thread, sender, .. } = worker;
        drop(sender);
        thread.join().unwrap();
        assert!(!state.worker_alive());
    }
}
