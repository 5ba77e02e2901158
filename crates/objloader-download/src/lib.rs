//! Resolution of requested ids against the remote object service.
//!
//! The [`Downloader`] coalesces ids into batch requests through a
//! [`BatchingQueue`](objloader_queue::BatchingQueue), streams each response
//! through a [`RecordDecoder`], and reports one [`Resolution`] per requested
//! id. The service itself sits behind the [`ObjectService`] trait:
//!
//! - [`HttpObjectService`] -- the real HTTP endpoint, via `reqwest`
//! - [`MemoryObjectService`] -- fixed in-memory objects for tests
//!
//! [`Resolution`]: objloader_types::Resolution

pub mod decoder;
pub mod downloader;
pub mod error;
pub mod http;
pub mod memory;
pub mod service;

pub use decoder::{MalformedRecord, Record, RecordDecoder};
pub use downloader::{AdaptiveBatching, Downloader, DownloaderConfig, MAX_CONCURRENT_BATCHES};
pub use error::{DownloadError, DownloadResult};
pub use http::{HttpObjectService, ServiceEndpoint};
pub use memory::{MemoryObjectService, ResponseFormat};
pub use service::{ByteStream, ObjectService};
