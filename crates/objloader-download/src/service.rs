use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use objloader_types::BaseId;

use crate::error::DownloadResult;

/// Response body of a batch request, delivered as it arrives.
pub type ByteStream = BoxStream<'static, DownloadResult<Bytes>>;

/// Remote object service.
#[async_trait]
pub trait ObjectService: Send + Sync {
    /// Request every id in one call. The body is either `id\tjson` lines or
    /// a JSON array; ids unknown to the service are simply absent.
    async fn fetch_batch(&self, ids: &[BaseId]) -> DownloadResult<ByteStream>;

    /// Fetch one object's JSON directly.
    async fn fetch_single(&self, id: &BaseId) -> DownloadResult<Bytes>;
}
