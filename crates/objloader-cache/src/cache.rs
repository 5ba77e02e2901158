use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use objloader_queue::{BatchProcessor, BatchingQueue, Queue};
use objloader_ring::MessageSender;
use objloader_store::{ObjectStore, StoreError};
use objloader_types::{BaseId, Item};
use tracing::{debug, info, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::worker::{hand_off, persist, CacheState, PersistenceWorker};

/// Where flushed write batches go.
enum WritePath {
    /// `put_batch` from the blocking pool.
    Inline { store: Arc<dyn ObjectStore> },
    /// `SaveBatch` over the worker ring.
    Offload {
        sender: Arc<Mutex<MessageSender>>,
        attempt: Duration,
    },
}

struct WriteProcessor {
    path: WritePath,
    state: Arc<CacheState>,
}

#[async_trait]
impl BatchProcessor<Item> for WriteProcessor {
    async fn process(&self, batch: Vec<Item>) {
        let state = Arc::clone(&self.state);
        state.begin(batch.len());
        let task = match &self.path {
            WritePath::Inline { store } => {
                let store = Arc::clone(store);
                tokio::task::spawn_blocking(move || persist(store.as_ref(), &state, &batch))
            }
            WritePath::Offload { sender, attempt } => {
                let sender = Arc::clone(sender);
                let attempt = *attempt;
                tokio::task::spawn_blocking(move || hand_off(&sender, batch, attempt, &state))
            }
        };
        if let Err(e) = task.await {
            self.state.degrade(&CacheError::Task(e.to_string()));
        }
    }
}

/// Durable client-side cache of resolved Items.
///
/// Writes are keyed by id and coalesced, so an id written twice before a
/// flush is stored once. Reads run on the blocking pool. Storage failures
/// never surface to callers: the first one is logged and the cache switches
/// to network-only mode, where every lookup misses and writes are dropped.
pub struct Cache {
    config: CacheConfig,
    store: Arc<dyn ObjectStore>,
    state: Arc<CacheState>,
    writes: BatchingQueue<BaseId, Item>,
    worker: Mutex<Option<PersistenceWorker>>,
    finished: AtomicBool,
}

impl Cache {
    /// Create the cache. Must be called inside a tokio runtime.
    pub fn new(config: CacheConfig, store: Arc<dyn ObjectStore>) -> CacheResult<Self> {
        config.validate()?;
        let state = Arc::new(CacheState::default());

        let (path, worker) = if config.offload_writes {
            let worker = PersistenceWorker::spawn(
                config.ring_capacity_bytes,
                Arc::clone(&store),
                Arc::clone(&state),
            )?;
            let path = WritePath::Offload {
                sender: worker.sender(),
                attempt: config.enqueue_timeout(),
            };
            (path, Some(worker))
        } else {
            (
                WritePath::Inline {
                    store: Arc::clone(&store),
                },
                None,
            )
        };

        let processor = Arc::new(WriteProcessor {
            path,
            state: Arc::clone(&state),
        });
        let writes = BatchingQueue::new(config.write_batch.clone(), processor)?;
        debug!(
            offload = config.offload_writes,
            entries = store.len(),
            "cache opened"
        );

        Ok(Self {
            config,
            store,
            state,
            writes,
            worker: Mutex::new(worker),
            finished: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn readable(&self) -> bool {
        !self.state.is_degraded() && !self.finished.load(Ordering::Acquire)
    }

    /// Queue an item for persistence. Dropped once degraded or finished.
    pub fn write(&self, item: Item) {
        if !self.readable() {
            trace!(id = %item.base_id, "cache write skipped");
            return;
        }
        self.writes.add(item.base_id.clone(), item);
    }

    /// Point lookup. `None` on a miss or when the cache is unusable.
    pub async fn get_item(&self, id: &BaseId) -> Option<Item> {
        if !self.readable() {
            return None;
        }
        let store = Arc::clone(&self.store);
        let key = id.clone();
        match tokio::task::spawn_blocking(move || store.get(&key)).await {
            Ok(Ok(Some(item))) if &item.base_id == id => Some(item),
            Ok(Ok(Some(item))) => {
                warn!(id = %id, stored = %item.base_id, "cache returned a different id");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                self.state.degrade(&e);
                None
            }
            Err(e) => {
                self.state.degrade(&CacheError::Task(e.to_string()));
                None
            }
        }
    }

    /// Partition `ids` into hits, pushed to `found`, and misses, pushed to
    /// `not_found`. Every id lands in exactly one of the two.
    pub async fn get_items(
        &self,
        ids: Vec<BaseId>,
        found: &dyn Queue<Item>,
        not_found: &dyn Queue<BaseId>,
    ) {
        let mut remaining = ids;
        let mut hits = 0usize;
        let mut misses = 0usize;
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(self.config.max_read_batch));
            let chunk = std::mem::replace(&mut remaining, rest);

            if !self.readable() {
                misses += chunk.len();
                chunk.into_iter().for_each(|id| not_found.add(id));
                continue;
            }

            let store = Arc::clone(&self.store);
            let keys = chunk.clone();
            let lookup = match tokio::task::spawn_blocking(move || store.get_many(&keys)).await {
                Ok(lookup) => lookup,
                Err(e) => Err(StoreError::Unavailable(e.to_string())),
            };

            match lookup {
                Ok(slots) if slots.len() == chunk.len() => {
                    for (id, slot) in chunk.into_iter().zip(slots) {
                        match slot {
                            Some(item) if item.base_id == id => {
                                hits += 1;
                                found.add(item);
                            }
                            _ => {
                                misses += 1;
                                not_found.add(id);
                            }
                        }
                    }
                }
                Ok(slots) => {
                    self.state.degrade(&format!(
                        "get_many returned {} slots for {} ids",
                        slots.len(),
                        chunk.len()
                    ));
                    misses += chunk.len();
                    chunk.into_iter().for_each(|id| not_found.add(id));
                }
                Err(e) => {
                    self.state.degrade(&e);
                    misses += chunk.len();
                    chunk.into_iter().for_each(|id| not_found.add(id));
                }
            }
        }
        trace!(hits, misses, "cache lookup");
    }

    /// Items accepted by `write` that are not yet stored or dropped.
    pub fn pending_writes(&self) -> usize {
        self.writes.count() + self.state.in_flight()
    }

    /// Items newly stored by this cache instance.
    pub fn stored_count(&self) -> u64 {
        self.state.stored()
    }

    /// Whether a storage failure switched the cache to network-only mode.
    pub fn is_degraded(&self) -> bool {
        self.state.is_degraded()
    }

    /// Drain pending writes, stop the worker, and flush the store.
    /// Later calls return immediately.
    pub async fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.writes.dispose_async().await;

        let worker = self.worker.lock().expect("lock poisoned").take();
        if let Some(worker) = worker {
            let deadline = self.config.shutdown_timeout();
            if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown(deadline)).await {
                warn!(error = %e, "cache worker shutdown task failed");
            }
        }

        if !self.state.is_degraded() {
            let store = Arc::clone(&self.store);
            match tokio::task::spawn_blocking(move || store.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.state.degrade(&e),
                Err(e) => self.state.degrade(&CacheError::Task(e.to_string())),
            }
        }
        info!(
            stored = self.state.stored(),
            degraded = self.state.is_degraded(),
            "cache finished"
        );
    }

    pub async fn dispose_async(&self) {
        self.finish().await
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("offload_writes", &self.config.offload_writes)
            .field("pending_writes", &self.pending_writes())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
