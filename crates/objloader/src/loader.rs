//! The loader façade and its orchestration task.
//!
//! One task owns all per-session state: the [`DefermentManager`], the set of
//! ids awaiting a resolution, and the output channel. Everything else talks
//! to it through [`Event`]s:
//!
//! ```text
//! request ──▶ cache lookup ──hit──────────────────────────┐
//!                  │                                     ▼
//!                  └─miss─▶ downloader ──resolution──▶ orchestrator ──▶ ItemStream
//!                                                        │   ▲
//!                              closure children ◀────────┘   └── cache write (network hits)
//! ```
//!
//! # Invariants
//!
//! - Every requested id stays in `in_flight` until exactly one resolution
//!   for it arrives.
//! - When nothing is in flight, held Items can only be waiting on each other,
//!   so they are failed at once instead of waiting for the timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use objloader_cache::Cache;
use objloader_defer::{DeferError, DefermentManager};
use objloader_download::{DownloadError, Downloader, ObjectService};
use objloader_queue::{FnQueue, Queue};
use objloader_store::ObjectStore;
use objloader_types::{Base, BaseId, Item, Resolution};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::error::{LoadError, LoadResult};
use crate::stream::ItemStream;

/// Events drained per iteration before pending lookups are issued.
const EVENT_BURST: usize = 256;

/// Where a resolved Item came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Cache,
    Network,
}

enum Event {
    Request(Vec<BaseId>),
    /// An Item resolved outside the pipeline, e.g. the root.
    Seed { item: Item, source: Source },
    Resolved { resolution: Resolution, source: Source },
    Watch {
        id: BaseId,
        reply: oneshot::Sender<LoadResult<Item>>,
    },
    Finish,
}

/// Running totals for one loader.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub requested: u64,
    pub cache_hits: u64,
    pub downloaded: u64,
    pub emitted: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requested: AtomicU64,
    cache_hits: AtomicU64,
    downloaded: AtomicU64,
    emitted: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoadStats {
        LoadStats {
            requested: self.requested.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Orchestrator {
    deferment: DefermentManager,
    cache: Arc<Cache>,
    downloader: Arc<Downloader>,
    events: mpsc::UnboundedSender<Event>,
    output: mpsc::UnboundedSender<LoadResult<Item>>,
    in_flight: HashSet<BaseId>,
    watchers: HashMap<BaseId, Vec<oneshot::Sender<LoadResult<Item>>>>,
    finishing: bool,
    counters: Arc<Counters>,
}

impl Orchestrator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let timeout = self.deferment.config().timeout();
        loop {
            if self.finishing && self.in_flight.is_empty() {
                break;
            }
            let event = match tokio::time::timeout(timeout, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    self.stalled();
                    continue;
                }
            };

            let mut lookups = Vec::new();
            self.handle(event, &mut lookups);
            for _ in 1..EVENT_BURST {
                match events.try_recv() {
                    Ok(event) => self.handle(event, &mut lookups),
                    Err(_) => break,
                }
            }
            self.lookup(lookups);

            if self.in_flight.is_empty() && !self.deferment.is_idle() {
                let failed = self
                    .deferment
                    .fail_all_pending("every pending item waits on another pending item");
                warn!(items = failed.len(), "dependency cycle among held items");
                self.report_failed(failed);
            }
        }
        self.close();
    }

    fn handle(&mut self, event: Event, lookups: &mut Vec<BaseId>) {
        match event {
            Event::Request(ids) => {
                for id in ids {
                    self.request(id, lookups);
                }
            }
            Event::Seed { item, source } => {
                self.deferment.mark_requested(&item.base_id);
                self.found(item, source, lookups);
            }
            Event::Resolved { resolution, source } => {
                self.in_flight.remove(resolution.id());
                match resolution {
                    Resolution::Found(item) => self.found(item, source, lookups),
                    Resolution::Missing(id) => {
                        let failed = self.deferment.fail(&id, DeferError::NotFound(id.clone()));
                        self.report_failed(failed);
                    }
                    Resolution::Failed { id, reason } => {
                        let failed = self
                            .deferment
                            .fail(&id, DeferError::Unavailable { id: id.clone(), reason });
                        self.report_failed(failed);
                    }
                }
            }
            Event::Watch { id, reply } => self.watch(id, reply, lookups),
            Event::Finish => {
                if !self.finishing {
                    debug!(in_flight = self.in_flight.len(), "finish requested");
                }
                self.finishing = true;
            }
        }
    }

    fn request(&mut self, id: BaseId, lookups: &mut Vec<BaseId>) {
        if self.deferment.mark_requested(&id) {
            self.counters.requested.fetch_add(1, Ordering::Relaxed);
            self.in_flight.insert(id.clone());
            lookups.push(id);
        }
    }

    fn found(&mut self, item: Item, source: Source, lookups: &mut Vec<BaseId>) {
        match source {
            Source::Cache => self.counters.cache_hits.fetch_add(1, Ordering::Relaxed),
            Source::Network => {
                self.cache.write(item.clone());
                self.counters.downloaded.fetch_add(1, Ordering::Relaxed)
            }
        };
        let advance = self.deferment.accept(item);
        for child in advance.requests {
            self.counters.requested.fetch_add(1, Ordering::Relaxed);
            self.in_flight.insert(child.clone());
            lookups.push(child);
        }
        for item in advance.emitted {
            self.emit(item);
        }
        self.report_failed(advance.failed);
    }

    fn watch(&mut self, id: BaseId, reply: oneshot::Sender<LoadResult<Item>>, lookups: &mut Vec<BaseId>) {
        if let Some(err) = self.deferment.failure(&id) {
            let _ = reply.send(Err(err.clone().into()));
            return;
        }
        if self.deferment.is_emitted(&id) {
            // Already released, so its closure is too; fetch it again.
            let cache = Arc::clone(&self.cache);
            let downloader = Arc::clone(&self.downloader);
            tokio::spawn(async move {
                let item = match cache.get_item(&id).await {
                    Some(item) => Ok(item),
                    None => downloader.download_single(&id).await.map_err(LoadError::from),
                };
                let _ = reply.send(item);
            });
            return;
        }
        self.watchers.entry(id.clone()).or_default().push(reply);
        self.request(id, lookups);
    }

    fn emit(&mut self, item: Item) {
        if let Some(watchers) = self.watchers.remove(&item.base_id) {
            for reply in watchers {
                let _ = reply.send(Ok(item.clone()));
            }
        }
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        if self.output.send(Ok(item)).is_err() {
            debug!("item stream dropped");
        }
    }

    fn report_failed(&mut self, failed: Vec<(BaseId, DeferError)>) {
        for (id, err) in failed {
            debug!(id = %id, error = %err, "object failed");
            if let Some(watchers) = self.watchers.remove(&id) {
                for reply in watchers {
                    let _ = reply.send(Err(err.clone().into()));
                }
            }
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = self.output.send(Err(err.into()));
        }
    }

    /// Resolve `ids` against the cache; misses go on to the downloader.
    fn lookup(&self, ids: Vec<BaseId>) {
        if ids.is_empty() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let downloader = Arc::clone(&self.downloader);
        let events = self.events.clone();
        tokio::spawn(async move {
            let found = FnQueue(move |item: Item| {
                let resolution = Resolution::Found(item);
                if events.send(Event::Resolved { resolution, source: Source::Cache }).is_err() {
                    debug!("orchestrator gone, cache hit discarded");
                }
            });
            let missed = FnQueue(move |id: BaseId| downloader.add(id));
            cache.get_items(ids, &found, &missed).await;
        });
    }

    /// No event within the timeout while work is outstanding.
    fn stalled(&mut self) {
        if self.in_flight.is_empty() && self.deferment.is_idle() {
            return;
        }
        warn!(
            in_flight = self.in_flight.len(),
            held = self.deferment.pending_count(),
            "no progress within the deferment timeout"
        );
        let mut stuck: Vec<BaseId> = self.in_flight.drain().collect();
        stuck.sort();
        for id in stuck {
            let err = DeferError::CycleOrMissingDependency {
                id: id.clone(),
                reason: "no resolution within the deferment timeout".into(),
            };
            let failed = self.deferment.fail(&id, err);
            self.report_failed(failed);
        }
        let failed = self.deferment.fail_all_pending("no progress within the deferment timeout");
        self.report_failed(failed);
    }

    fn close(mut self) {
        for (_, watchers) in self.watchers.drain() {
            for reply in watchers {
                let _ = reply.send(Err(LoadError::Closed));
            }
        }
        info!(
            emitted = self.deferment.emitted_count(),
            stats = ?self.counters.snapshot(),
            "load finished"
        );
    }
}

/// Streams content-addressed object graphs in dependency order.
///
/// Requested ids are looked up in the cache first; misses are batched to the
/// object service. Every resolved Item is written through to the cache and
/// released on the [`ItemStream`] only after everything in its closure.
///
/// Must be created inside a tokio runtime.
pub struct ObjectLoader {
    config: LoaderConfig,
    cache: Arc<Cache>,
    downloader: Arc<Downloader>,
    events: mpsc::UnboundedSender<Event>,
    output: Mutex<Option<mpsc::UnboundedReceiver<LoadResult<Item>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ObjectLoader {
    pub fn new(
        config: LoaderConfig,
        service: Arc<dyn ObjectService>,
        store: Arc<dyn ObjectStore>,
    ) -> LoadResult<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(Cache::new(config.cache.clone(), store)?);
        let results_tx = events_tx.clone();
        let results: Arc<dyn Queue<Resolution>> = Arc::new(FnQueue(move |resolution: Resolution| {
            let event = Event::Resolved { resolution, source: Source::Network };
            if results_tx.send(event).is_err() {
                debug!("orchestrator gone, download result discarded");
            }
        }));
        let downloader = Arc::new(Downloader::new(config.downloader.clone(), service, results)?);

        let counters = Arc::new(Counters::default());
        let orchestrator = Orchestrator {
            deferment: DefermentManager::with_config(config.deferment.clone()),
            cache: Arc::clone(&cache),
            downloader: Arc::clone(&downloader),
            events: events_tx.clone(),
            output: output_tx,
            in_flight: HashSet::new(),
            watchers: HashMap::new(),
            finishing: false,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(orchestrator.run(events_rx));

        Ok(Self {
            config,
            cache,
            downloader,
            events: events_tx,
            output: Mutex::new(Some(output_rx)),
            task: Mutex::new(Some(task)),
            counters,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn stats(&self) -> LoadStats {
        self.counters.snapshot()
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("loader already finished, event dropped");
        }
    }

    /// Request ids; results arrive on the item stream. Ids already requested
    /// in this session are ignored.
    pub fn request_all(&self, ids: impl IntoIterator<Item = BaseId>) {
        let ids: Vec<BaseId> = ids.into_iter().collect();
        if !ids.is_empty() {
            self.send(Event::Request(ids));
        }
    }

    /// The output stream. Can be taken once.
    pub fn items(&self) -> LoadResult<ItemStream> {
        self.output
            .lock()
            .expect("lock poisoned")
            .take()
            .map(ItemStream::new)
            .ok_or(LoadError::AlreadyConsumed)
    }

    /// Accept no further work; the stream ends once in-flight work drains.
    pub fn finish(&self) {
        self.send(Event::Finish);
    }

    async fn load_root(&self, id: &BaseId) -> LoadResult<(Item, Source)> {
        if let Some(item) = self.cache.get_item(id).await {
            return Ok((item, Source::Cache));
        }
        match self.downloader.download_single(id).await {
            Ok(item) => Ok((item, Source::Network)),
            Err(DownloadError::NotFound(_)) => Err(LoadError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one object directly: the cache, then a single request that
    /// skips the batch window. Does not wait for its closure.
    pub async fn get_root_object(&self, id: &BaseId) -> LoadResult<Item> {
        let (item, source) = self.load_root(id).await?;
        if source == Source::Network {
            self.cache.write(item.clone());
        }
        Ok(item)
    }

    /// Load `root` and its whole closure. Fails with `NotFound(root)` when the
    /// root cannot be loaded; otherwise returns the item stream, which ends
    /// once the graph has drained.
    pub async fn get_object_iterator(&self, root: &BaseId) -> LoadResult<ItemStream> {
        let stream = self.items()?;
        let loaded = self.load_root(root).await.and_then(|(item, source)| {
            let total = item.base.children().filter(|c| *c != root).count() + 1;
            self.downloader.adapt_to_graph(total)?;
            Ok((item, source, total))
        });
        match loaded {
            Ok((item, source, total)) => {
                info!(root = %root, total, "root loaded");
                self.send(Event::Seed { item, source });
                self.finish();
                Ok(stream)
            }
            Err(e) => {
                *self.output.lock().expect("lock poisoned") = Some(stream.into_inner());
                Err(e)
            }
        }
    }

    /// Wait until `id` is released, requesting it if needed.
    pub async fn get_object(&self, id: &BaseId) -> LoadResult<Base> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Watch { id: id.clone(), reply });
        let item = rx.await.map_err(|_| LoadError::Closed)??;
        Ok(item.base)
    }

    /// The root plus every id in its closure.
    pub async fn total_object_count(&self, root: &BaseId) -> LoadResult<usize> {
        let item = self.get_root_object(root).await?;
        Ok(item.base.children().filter(|c| *c != root).count() + 1)
    }

    /// Finish, wait for the graph to drain, then drain the downloader and
    /// flush the cache.
    pub async fn dispose_async(&self) {
        self.finish();
        let task = self.task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "orchestrator task failed");
            }
        }
        self.downloader.finish().await;
        self.cache.finish().await;
    }
}

impl Drop for ObjectLoader {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Finish);
    }
}

impl std::fmt::Debug for ObjectLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLoader")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
