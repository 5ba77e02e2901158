use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::{QueueError, QueueResult};
use crate::keyed::KeyedQueue;
use crate::sink::Queue;

/// Size and time bounds of a batch window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A window is flushed as soon as it holds this many values.
    pub batch_size: usize,
    /// A window is flushed at most this long after its first value arrived.
    pub max_wait_ms: u64,
}

impl BatchConfig {
    pub fn new(batch_size: usize, max_wait_ms: u64) -> Self {
        Self { batch_size, max_wait_ms }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.batch_size == 0 {
            return Err(QueueError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_wait_ms == 0 {
            return Err(QueueError::InvalidConfig("max_wait_ms must be positive".into()));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_wait_ms: 100,
        }
    }
}

/// Consumer of flushed batches.
#[async_trait]
pub trait BatchProcessor<V>: Send + Sync {
    async fn process(&self, batch: Vec<V>);
}

/// The current batch window.
struct Window<K, V> {
    pending: KeyedQueue<K, V>,
    /// When the max-wait timer was armed; `None` while idle.
    armed_at: Option<Instant>,
    disposed: bool,
    /// Batch sizes used in rotation, one per flushed batch.
    sizes: Vec<usize>,
    slot: usize,
}

impl<K: Eq + Hash + Clone, V> Window<K, V> {
    fn batch_size(&self) -> usize {
        self.sizes[self.slot % self.sizes.len()]
    }

    fn take(&mut self) -> Vec<V> {
        let batch = self.pending.take_front(self.batch_size());
        self.slot = (self.slot + 1) % self.sizes.len();
        self.armed_at = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        batch
    }
}

struct Shared<K, V> {
    config: BatchConfig,
    window: Mutex<Window<K, V>>,
    wake: Notify,
    disposed: AtomicBool,
    batches: AtomicU64,
    delivered: AtomicU64,
}

impl<K: Eq + Hash + Clone, V> Shared<K, V> {
    /// Wait for the next batch to become due. `None` once disposed and empty.
    async fn next_batch(&self) -> Option<Vec<V>> {
        loop {
            let deadline = {
                let mut w = self.window.lock().expect("batch window lock poisoned");
                if w.pending.len() >= w.batch_size() || (w.disposed && !w.pending.is_empty()) {
                    return Some(w.take());
                }
                if w.disposed {
                    return None;
                }
                match w.armed_at {
                    Some(armed) => {
                        let due = armed + self.config.max_wait();
                        if Instant::now() >= due {
                            return Some(w.take());
                        }
                        Some(due)
                    }
                    None => None,
                }
            };

            match deadline {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }
}

/// Generic coalescing queue: `Idle → Accumulating → Flushing → Idle`, with
/// `Disposed` terminal.
///
/// Values are keyed; adding a key that is still pending replaces its value
/// so the same id is never processed twice in one window. One batch is in
/// flight at a time and no batch exceeds `batch_size`, or the current
/// entry of the schedule set through [`set_batch_sizes`](Self::set_batch_sizes).
pub struct BatchingQueue<K, V> {
    shared: Arc<Shared<K, V>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> BatchingQueue<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// Create the queue and spawn its dispatch task on the current runtime.
    pub fn new(config: BatchConfig, processor: Arc<dyn BatchProcessor<V>>) -> QueueResult<Self> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let shared = Arc::new(Shared {
            window: Mutex::new(Window {
                pending: KeyedQueue::new(),
                armed_at: None,
                disposed: false,
                sizes: vec![config.batch_size],
                slot: 0,
            }),
            config,
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });

        let task_shared = Arc::clone(&shared);
        let dispatcher = handle.spawn(async move {
            while let Some(batch) = task_shared.next_batch().await {
                let n = batch.len();
                trace!(size = n, "flushing batch");
                processor.process(batch).await;
                task_shared.batches.fetch_add(1, Ordering::Relaxed);
                task_shared.delivered.fetch_add(n as u64, Ordering::Relaxed);
            }
            debug!("batching queue dispatcher stopped");
        });

        Ok(Self {
            shared,
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        })
    }

    /// Upsert a value into the current window. Ignored once disposed.
    pub fn add(&self, key: K, value: V) {
        let notify = {
            let mut w = self.shared.window.lock().expect("batch window lock poisoned");
            if w.disposed {
                trace!("add after dispose ignored");
                return;
            }
            let was_idle = w.pending.is_empty();
            w.pending.upsert(key, value);
            if was_idle {
                w.armed_at = Some(Instant::now());
            }
            was_idle || w.pending.len() >= w.batch_size()
        };
        if notify {
            self.shared.wake.notify_one();
        }
    }

    /// Values waiting in the window (not yet handed to the processor).
    pub fn count(&self) -> usize {
        self.shared
            .window
            .lock()
            .expect("batch window lock poisoned")
            .pending
            .len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Batches handed to the processor so far.
    pub fn batches_dispatched(&self) -> u64 {
        self.shared.batches.load(Ordering::Relaxed)
    }

    /// Values handed to the processor so far.
    pub fn values_delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// Replace the configured batch size with a rotation: the next batch
    /// holds up to `sizes[0]` values, the one after `sizes[1]`, and so on,
    /// wrapping around.
    pub fn set_batch_sizes(&self, sizes: Vec<usize>) -> QueueResult<()> {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(QueueError::InvalidConfig(
                "batch sizes must be a non-empty list of positive sizes".into(),
            ));
        }
        {
            let mut w = self.shared.window.lock().expect("batch window lock poisoned");
            w.sizes = sizes;
            w.slot = 0;
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Size limit of the next batch to flush.
    pub fn next_batch_size(&self) -> usize {
        self.shared
            .window
            .lock()
            .expect("batch window lock poisoned")
            .batch_size()
    }

    /// Flush everything pending without waiting for the timer, wait for the
    /// processor to finish, and stop accepting values.
    pub async fn dispose_async(&self) {
        {
            let mut w = self.shared.window.lock().expect("batch window lock poisoned");
            w.disposed = true;
        }
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.wake.notify_one();

        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "batch dispatcher terminated abnormally");
            }
        }
    }
}

impl<K, V> Drop for BatchingQueue<K, V> {
    /// The dispatcher still flushes what is pending, then exits.
    fn drop(&mut self) {
        if let Ok(mut w) = self.shared.window.lock() {
            w.disposed = true;
        }
        self.shared.disposed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

impl<V> Queue<V> for BatchingQueue<V, V>
where
    V: Eq + Hash + Clone + Send + 'static,
{
    fn add(&self, value: V) {
        BatchingQueue::add(self, value.clone(), value);
    }
}
