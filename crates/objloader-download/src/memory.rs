use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use objloader_types::{Base, BaseId};

use crate::error::{DownloadError, DownloadResult};
use crate::service::{ByteStream, ObjectService};

/// Body layout produced for batch requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    /// `id\tjson\n` per object.
    #[default]
    Lines,
    /// A JSON array of objects.
    JsonArray,
}

/// In-memory object service for tests and offline use.
///
/// Serves a fixed set of objects, optionally split into chunks of a fixed
/// byte size so record boundaries fall anywhere, and counts the requests it
/// receives.
pub struct MemoryObjectService {
    objects: HashMap<BaseId, Vec<u8>>,
    format: ResponseFormat,
    chunk_size: Option<usize>,
    latency: Option<Duration>,
    failure: Option<DownloadError>,
    batch_requests: AtomicU64,
    single_requests: AtomicU64,
    batch_sizes: Mutex<Vec<usize>>,
}

impl MemoryObjectService {
    pub fn new(bases: impl IntoIterator<Item = Base>) -> Self {
        let objects = bases
            .into_iter()
            .map(|base| (base.id.clone(), base.to_json_bytes()))
            .collect();
        Self {
            objects,
            format: ResponseFormat::default(),
            chunk_size: None,
            latency: None,
            failure: None,
            batch_requests: AtomicU64::new(0),
            single_requests: AtomicU64::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    /// Split every response body into chunks of `bytes`.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    /// Sleep before answering each request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every request with `error`.
    pub fn failing_with(mut self, error: DownloadError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Serve `body` verbatim for `id`, valid or not.
    pub fn with_raw(mut self, id: impl Into<BaseId>, body: impl Into<Vec<u8>>) -> Self {
        self.objects.insert(id.into(), body.into());
        self
    }

    pub fn batch_requests(&self) -> u64 {
        self.batch_requests.load(Ordering::Relaxed)
    }

    pub fn single_requests(&self) -> u64 {
        self.single_requests.load(Ordering::Relaxed)
    }

    /// Number of ids in each batch request, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().expect("lock poisoned").clone()
    }

    fn render(&self, ids: &[BaseId]) -> Vec<u8> {
        let found = ids
            .iter()
            .filter_map(|id| self.objects.get(id).map(|body| (id, body)));
        let mut out = Vec::new();
        match self.format {
            ResponseFormat::Lines => {
                for (id, body) in found {
                    out.extend_from_slice(id.as_str().as_bytes());
                    out.push(b'\t');
                    out.extend_from_slice(body);
                    out.push(b'\n');
                }
            }
            ResponseFormat::JsonArray => {
                out.push(b'[');
                for (i, (_, body)) in found.enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(body);
                }
                out.push(b']');
            }
        }
        out
    }

    async fn before_request(&self) -> DownloadResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectService for MemoryObjectService {
    async fn fetch_batch(&self, ids: &[BaseId]) -> DownloadResult<ByteStream> {
        self.batch_requests.fetch_add(1, Ordering::Relaxed);
        self.batch_sizes.lock().expect("lock poisoned").push(ids.len());
        self.before_request().await?;

        let body = self.render(ids);
        let chunks: Vec<DownloadResult<Bytes>> = match self.chunk_size {
            Some(size) => body
                .chunks(size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
            None => vec![Ok(Bytes::from(body))],
        };
        Ok(stream::iter(chunks).boxed())
    }

    async fn fetch_single(&self, id: &BaseId) -> DownloadResult<Bytes> {
        self.single_requests.fetch_add(1, Ordering::Relaxed);
        self.before_request().await?;
        self.objects
            .get(id)
            .map(|body| Bytes::copy_from_slice(body))
            .ok_or_else(|| DownloadError::NotFound(id.clone()))
    }
}

impl std::fmt::Debug for MemoryObjectService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectService")
            .field("objects", &self.objects.len())
            .field("format", &self.format)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
