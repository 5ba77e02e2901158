use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use objloader_queue::{BatchConfig, BatchProcessor, BatchingQueue, Queue};
use objloader_types::{Base, BaseId, Item, Resolution};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::decoder::{Record, RecordDecoder};
use crate::error::{DownloadError, DownloadResult};
use crate::service::ObjectService;

/// Upper bound for `max_concurrent_batches`.
pub const MAX_CONCURRENT_BATCHES: usize = 1024;

/// Batch sizing for a load whose graph size is known up front.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBatching {
    pub enabled: bool,
    /// Graphs of at most this many objects go out as a single batch.
    pub small_graph_threshold: usize,
    /// Batch sizes used in rotation for larger graphs.
    pub large_graph_sizes: Vec<usize>,
}

impl AdaptiveBatching {
    /// Batch sizes for a graph of `total` objects, root included.
    pub fn sizes_for(&self, total: usize) -> Vec<usize> {
        if total <= self.small_graph_threshold {
            vec![total.max(1)]
        } else {
            self.large_graph_sizes.clone()
        }
    }

    fn validate(&self) -> DownloadResult<()> {
        if self.enabled && (self.large_graph_sizes.is_empty() || self.large_graph_sizes.contains(&0)) {
            return Err(DownloadError::Config(
                "adaptive.large_graph_sizes must be a non-empty list of positive sizes".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AdaptiveBatching {
    fn default() -> Self {
        Self {
            enabled: true,
            small_graph_threshold: 50,
            large_graph_sizes: vec![10_000, 25_000, 10_000, 1_000],
        }
    }
}

/// Downloader tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Ids per batch request and how long a partial batch may wait.
    pub batch: BatchConfig,
    /// Batch requests allowed in flight at once.
    pub max_concurrent_batches: usize,
    /// Replaces `batch.batch_size` once a root load knows its graph size.
    pub adaptive: AdaptiveBatching,
}

impl DownloaderConfig {
    pub fn validate(&self) -> DownloadResult<()> {
        self.batch
            .validate()
            .map_err(|e| DownloadError::Config(e.to_string()))?;
        if !(1..=MAX_CONCURRENT_BATCHES).contains(&self.max_concurrent_batches) {
            return Err(DownloadError::Config(format!(
                "max_concurrent_batches must be between 1 and {MAX_CONCURRENT_BATCHES}"
            )));
        }
        self.adaptive.validate()
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::new(200, 1000),
            max_concurrent_batches: 4,
            adaptive: AdaptiveBatching::default(),
        }
    }
}

/// Runs one batch request per flushed window.
struct BatchFetcher {
    service: Arc<dyn ObjectService>,
    results: Arc<dyn Queue<Resolution>>,
    permits: Arc<Semaphore>,
    batches: Arc<AtomicU64>,
}

#[async_trait]
impl BatchProcessor<BaseId> for BatchFetcher {
    /// Returns once the request is started; the window is free to fill
    /// again while up to `max_concurrent_batches` requests run.
    async fn process(&self, batch: Vec<BaseId>) {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            for id in batch {
                self.results.add(Resolution::Failed {
                    id,
                    reason: "downloader closed".into(),
                });
            }
            return;
        };
        let n = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let service = Arc::clone(&self.service);
        let results = Arc::clone(&self.results);
        tokio::spawn(async move {
            run_batch(service.as_ref(), results.as_ref(), batch, n).await;
            drop(permit);
        });
    }
}

/// Resolve every id in `ids` exactly once.
async fn run_batch(
    service: &dyn ObjectService,
    results: &dyn Queue<Resolution>,
    ids: Vec<BaseId>,
    n: u64,
) {
    let mut wanted: HashSet<BaseId> = ids.iter().cloned().collect();
    let mut decoder = RecordDecoder::new();
    let outcome = stream_batch(service, results, &ids, &mut wanted, &mut decoder).await;

    let leftover: Vec<BaseId> = ids.into_iter().filter(|id| wanted.contains(id)).collect();
    match outcome {
        Err(e) => {
            warn!(batch = n, unresolved = leftover.len(), error = %e, "batch request failed");
            let reason = e.to_string();
            for id in leftover {
                results.add(Resolution::Failed {
                    id,
                    reason: reason.clone(),
                });
            }
        }
        Ok(()) if decoder.records() == 0 && decoder.parse_errors() > 0 => {
            let e = DownloadError::Network(format!(
                "batch yielded no valid records ({} malformed)",
                decoder.parse_errors()
            ));
            warn!(batch = n, error = %e, "batch failed");
            let reason = e.to_string();
            for id in leftover {
                results.add(Resolution::Failed {
                    id,
                    reason: reason.clone(),
                });
            }
        }
        Ok(()) => {
            if !leftover.is_empty() {
                debug!(batch = n, missing = leftover.len(), "ids absent from response");
            }
            for id in leftover {
                results.add(Resolution::Missing(id));
            }
        }
    }
    debug!(
        batch = n,
        records = decoder.records(),
        parse_errors = decoder.parse_errors(),
        "batch complete"
    );
}

async fn stream_batch(
    service: &dyn ObjectService,
    results: &dyn Queue<Resolution>,
    ids: &[BaseId],
    wanted: &mut HashSet<BaseId>,
    decoder: &mut RecordDecoder,
) -> DownloadResult<()> {
    let mut body = service.fetch_batch(ids).await?;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        deliver(decoder.push(&chunk), wanted, results);
    }
    deliver(decoder.finish(), wanted, results);
    Ok(())
}

fn deliver(records: Vec<Record>, wanted: &mut HashSet<BaseId>, results: &dyn Queue<Resolution>) {
    for record in records {
        match record {
            Ok(item) => {
                if wanted.remove(&item.base_id) {
                    results.add(Resolution::Found(item));
                } else {
                    debug!(id = %item.base_id, "ignoring unrequested or duplicate record");
                }
            }
            Err(malformed) => {
                if let Some(id) = malformed.id.filter(|id| wanted.remove(id)) {
                    results.add(Resolution::Failed {
                        id,
                        reason: DownloadError::Parse(malformed.reason).to_string(),
                    });
                }
            }
        }
    }
}

/// Resolves requested ids against the remote object service.
///
/// Ids added through [`add`](Self::add) are coalesced into batch requests;
/// each requested id produces exactly one [`Resolution`] on the results
/// queue: `Found` when its record arrived, `Missing` when the response
/// completed without it, `Failed` when the request failed.
pub struct Downloader {
    config: DownloaderConfig,
    service: Arc<dyn ObjectService>,
    queue: BatchingQueue<BaseId, BaseId>,
    permits: Arc<Semaphore>,
    batches: Arc<AtomicU64>,
}

impl Downloader {
    /// Create the downloader. Must be called inside a tokio runtime.
    pub fn new(
        config: DownloaderConfig,
        service: Arc<dyn ObjectService>,
        results: Arc<dyn Queue<Resolution>>,
    ) -> DownloadResult<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent_batches));
        let batches = Arc::new(AtomicU64::new(0));
        let fetcher = Arc::new(BatchFetcher {
            service: Arc::clone(&service),
            results,
            permits: Arc::clone(&permits),
            batches: Arc::clone(&batches),
        });
        let queue = BatchingQueue::new(config.batch.clone(), fetcher)
            .map_err(|e| DownloadError::Config(e.to_string()))?;
        Ok(Self {
            config,
            service,
            queue,
            permits,
            batches,
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Queue an id for the next batch request.
    pub fn add(&self, id: BaseId) {
        self.queue.add(id.clone(), id);
    }

    /// Size batches for a graph of `total` objects. Without adaptive
    /// batching the configured `batch.batch_size` stays in force.
    pub fn adapt_to_graph(&self, total: usize) -> DownloadResult<()> {
        if !self.config.adaptive.enabled {
            return Ok(());
        }
        let sizes = self.config.adaptive.sizes_for(total);
        debug!(total, ?sizes, "adaptive batch sizes");
        self.queue
            .set_batch_sizes(sizes)
            .map_err(|e| DownloadError::Config(e.to_string()))
    }

    /// Size limit of the next batch request.
    pub fn next_batch_size(&self) -> usize {
        self.queue.next_batch_size()
    }

    /// Ids waiting for their batch window to flush.
    pub fn pending(&self) -> usize {
        self.queue.count()
    }

    /// Batch requests issued so far.
    pub fn batches_sent(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Fetch one object directly, bypassing the batch window.
    pub async fn download_single(&self, id: &BaseId) -> DownloadResult<Item> {
        let body = self.service.fetch_single(id).await?;
        let base = Base::from_json_slice(&body)?;
        Ok(Item::from_parts(id.clone(), base)?)
    }

    /// Flush pending ids and wait for every batch request to complete.
    pub async fn finish(&self) {
        self.queue.dispose_async().await;
        let Ok(max) = u32::try_from(self.config.max_concurrent_batches) else {
            warn!("max_concurrent_batches out of range");
            return;
        };
        match self.permits.acquire_many(max).await {
            Ok(all) => drop(all),
            Err(e) => warn!(error = %e, "downloader permits closed"),
        }
        info!(batches = self.batches_sent(), "downloader finished");
    }

    pub async fn dispose_async(&self) {
        self.finish().await
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .field("batches_sent", &self.batches_sent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectService, ResponseFormat};
    use objloader_queue::BufferQueue;
    use objloader_types::Closure;
    use std::collections::HashMap;
    use std::time::Duration;

    fn bases(n: usize) -> Vec<Base> {
        (0..n).map(|i| Base::new(format!("obj-{i:04}"))).collect()
    }

    fn downloader(
        service: &Arc<MemoryObjectService>,
        config: DownloaderConfig,
    ) -> (Downloader, Arc<BufferQueue<Resolution>>) {
        let results = Arc::new(BufferQueue::new());
        let d = Downloader::new(config, service.clone(), results.clone()).unwrap();
        (d, results)
    }

    fn by_id(resolutions: Vec<Resolution>) -> HashMap<String, Resolution> {
        resolutions
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect()
    }

    #[tokio::test]
    async fn two_thousand_ids_in_ten_batches() {
        let service = Arc::new(MemoryObjectService::new(bases(2000)).with_chunk_size(97));
        let (d, results) = downloader(
            &service,
            DownloaderConfig {
                batch: BatchConfig::new(200, 1000),
                ..DownloaderConfig::default()
            },
        );
        for base in bases(2000) {
            d.add(base.id);
        }
        d.finish().await;

        assert_eq!(service.batch_requests(), 10);
        assert!(service.batch_sizes().iter().all(|&n| n <= 200));
        assert_eq!(d.batches_sent(), 10);
        let resolved = by_id(results.take_all());
        assert_eq!(resolved.len(), 2000);
        assert!(resolved.values().all(|r| matches!(r, Resolution::Found(_))));
    }

    #[tokio::test]
    async fn absent_ids_are_missing() {
        let service = Arc::new(MemoryObjectService::new(bases(2)).with_format(ResponseFormat::JsonArray));
        let (d, results) = downloader(&service, DownloaderConfig::default());
        d.add(BaseId::new("obj-0000"));
        d.add(BaseId::new("ghost"));
        d.finish().await;

        let resolved = by_id(results.take_all());
        assert!(matches!(resolved["obj-0000"], Resolution::Found(_)));
        assert_eq!(resolved["ghost"], Resolution::Missing(BaseId::new("ghost")));
    }

    #[tokio::test]
    async fn duplicate_adds_are_requested_once() {
        let service = Arc::new(MemoryObjectService::new(bases(1)));
        let (d, results) = downloader(&service, DownloaderConfig::default());
        d.add(BaseId::new("obj-0000"));
        d.add(BaseId::new("obj-0000"));
        d.finish().await;
        assert_eq!(service.batch_sizes(), vec![1]);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_fails_every_id() {
        let service = Arc::new(
            MemoryObjectService::new(bases(3)).failing_with(DownloadError::Status {
                code: 502,
                message: "Bad Gateway".into(),
            }),
        );
        let (d, results) = downloader(&service, DownloaderConfig::default());
        for base in bases(3) {
            d.add(base.id);
        }
        d.finish().await;
        let resolved = results.take_all();
        assert_eq!(resolved.len(), 3);
        assert!(resolved
            .iter()
            .all(|r| matches!(r, Resolution::Failed { reason, .. } if reason.contains("502"))));
    }

    #[tokio::test]
    async fn malformed_record_is_skipped_not_fatal() {
        let service = Arc::new(MemoryObjectService::new(bases(2)).with_raw("bad", "{oops"));
        let (d, results) = downloader(&service, DownloaderConfig::default());
        d.add(BaseId::new("obj-0000"));
        d.add(BaseId::new("bad"));
        d.add(BaseId::new("obj-0001"));
        d.finish().await;

        let resolved = by_id(results.take_all());
        assert!(matches!(resolved["obj-0000"], Resolution::Found(_)));
        assert!(matches!(resolved["obj-0001"], Resolution::Found(_)));
        assert!(matches!(resolved["bad"], Resolution::Failed { .. }));
    }

    #[tokio::test]
    async fn all_malformed_batch_fails() {
        let service = Arc::new(
            MemoryObjectService::new(Vec::new())
                .with_raw("x", "not json")
                .with_raw("y", "{\"no\":\"id\"}"),
        );
        let (d, results) = downloader(&service, DownloaderConfig::default());
        d.add(BaseId::new("x"));
        d.add(BaseId::new("y"));
        d.add(BaseId::new("z"));
        d.finish().await;

        let resolved = by_id(results.take_all());
        assert_eq!(resolved.len(), 3);
        assert!(resolved.values().all(|r| matches!(r, Resolution::Failed { .. })));
        match &resolved["z"] {
            Resolution::Failed { reason, .. } => assert!(reason.contains("no valid records")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let service = Arc::new(
            MemoryObjectService::new(bases(40)).with_latency(Duration::from_millis(20)),
        );
        let (d, results) = downloader(
            &service,
            DownloaderConfig {
                batch: BatchConfig::new(5, 10),
                max_concurrent_batches: 2,
                ..DownloaderConfig::default()
            },
        );
        for base in bases(40) {
            d.add(base.id);
        }
        d.finish().await;
        assert_eq!(d.batches_sent(), 8);
        assert_eq!(results.len(), 40);
        assert_eq!(d.permits.available_permits(), 2);
    }

    #[tokio::test]
    async fn download_single_parses_root() {
        let root = Base::new("root").with_closure(
            [(BaseId::new("c1"), 1), (BaseId::new("c2"), 2)]
                .into_iter()
                .collect::<Closure>(),
        );
        let service = Arc::new(MemoryObjectService::new([root.clone()]).with_raw("weird", "[1]"));
        let (d, _results) = downloader(&service, DownloaderConfig::default());

        let item = d.download_single(&BaseId::new("root")).await.unwrap();
        assert_eq!(item.base, root);
        assert_eq!(
            d.download_single(&BaseId::new("nope")).await.unwrap_err(),
            DownloadError::NotFound(BaseId::new("nope"))
        );
        assert!(matches!(
            d.download_single(&BaseId::new("weird")).await,
            Err(DownloadError::InvalidBase(_))
        ));
        assert_eq!(service.batch_requests(), 0);
    }

    #[test]
    fn config_defaults_and_validation() {
        let c = DownloaderConfig::default();
        assert_eq!(c.batch, BatchConfig::new(200, 1000));
        assert_eq!(c.max_concurrent_batches, 4);
        assert!(c.adaptive.enabled);
        assert_eq!(c.adaptive.small_graph_threshold, 50);
        assert_eq!(c.adaptive.large_graph_sizes, vec![10_000, 25_000, 10_000, 1_000]);
        assert!(c.validate().is_ok());
        let bad = DownloaderConfig {
            max_concurrent_batches: 0,
            ..DownloaderConfig::default()
        };
        assert!(matches!(bad.validate(), Err(DownloadError::Config(_))));
    }

    #[test]
    fn concurrency_above_bound_is_rejected() {
        let at_bound = DownloaderConfig {
            max_concurrent_batches: MAX_CONCURRENT_BATCHES,
            ..DownloaderConfig::default()
        };
        assert!(at_bound.validate().is_ok());
        for max in [MAX_CONCURRENT_BATCHES + 1, u32::MAX as usize + 1, usize::MAX] {
            let bad = DownloaderConfig {
                max_concurrent_batches: max,
                ..DownloaderConfig::default()
            };
            assert!(matches!(bad.validate(), Err(DownloadError::Config(_))), "{max}");
        }
    }

    #[tokio::test]
    async fn oversized_concurrency_fails_construction() {
        let service = Arc::new(MemoryObjectService::new(bases(1)));
        let results = Arc::new(BufferQueue::new());
        let config = DownloaderConfig {
            max_concurrent_batches: usize::MAX,
            ..DownloaderConfig::default()
        };
        assert!(matches!(
            Downloader::new(config, service, results),
            Err(DownloadError::Config(_))
        ));
    }

    #[test]
    fn sizes_follow_graph_size() {
        let adaptive = AdaptiveBatching::default();
        assert_eq!(adaptive.sizes_for(1), vec![1]);
        assert_eq!(adaptive.sizes_for(50), vec![50]);
        assert_eq!(adaptive.sizes_for(51), vec![10_000, 25_000, 10_000, 1_000]);
        assert_eq!(adaptive.sizes_for(0), vec![1]);

        let empty = DownloaderConfig {
            adaptive: AdaptiveBatching {
                large_graph_sizes: Vec::new(),
                ..AdaptiveBatching::default()
            },
            ..DownloaderConfig::default()
        };
        assert!(matches!(empty.validate(), Err(DownloadError::Config(_))));
        let disabled = DownloaderConfig {
            adaptive: AdaptiveBatching {
                enabled: false,
                large_graph_sizes: Vec::new(),
                ..AdaptiveBatching::default()
            },
            ..DownloaderConfig::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[tokio::test]
    async fn small_graph_goes_out_in_one_batch() {
        let service = Arc::new(MemoryObjectService::new(bases(30)));
        let (d, results) = downloader(
            &service,
            DownloaderConfig {
                batch: BatchConfig::new(10, 60_000),
                ..DownloaderConfig::default()
            },
        );
        d.adapt_to_graph(30).unwrap();
        assert_eq!(d.next_batch_size(), 30);
        for base in bases(30) {
            d.add(base.id);
        }
        d.finish().await;
        assert_eq!(service.batch_sizes(), vec![30]);
        assert_eq!(results.len(), 30);
    }

    #[tokio::test]
    async fn large_graph_rotates_batch_sizes() {
        let service = Arc::new(MemoryObjectService::new(bases(20)));
        let (d, results) = downloader(
            &service,
            DownloaderConfig {
                batch: BatchConfig::new(100, 60_000),
                max_concurrent_batches: 1,
                adaptive: AdaptiveBatching {
                    enabled: true,
                    small_graph_threshold: 2,
                    large_graph_sizes: vec![3, 5],
                },
            },
        );
        d.adapt_to_graph(20).unwrap();
        for base in bases(20) {
            d.add(base.id);
        }
        d.finish().await;
        assert_eq!(service.batch_sizes(), vec![3, 5, 3, 5, 3, 1]);
        assert_eq!(results.len(), 20);
    }

    #[tokio::test]
    async fn disabled_adaptive_keeps_fixed_size() {
        let service = Arc::new(MemoryObjectService::new(bases(6)));
        let (d, _results) = downloader(
            &service,
            DownloaderConfig {
                batch: BatchConfig::new(4, 60_000),
                adaptive: AdaptiveBatching {
                    enabled: false,
                    ..AdaptiveBatching::default()
                },
                ..DownloaderConfig::default()
            },
        );
        d.adapt_to_graph(6).unwrap();
        assert_eq!(d.next_batch_size(), 4);
        for base in bases(6) {
            d.add(base.id);
        }
        d.finish().await;
        assert_eq!(service.batch_sizes(), vec![4, 2]);
    }
}
