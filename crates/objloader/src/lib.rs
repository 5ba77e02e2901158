//! Streaming object-graph loader.
//!
//! [`ObjectLoader`] wires the pieces together: a persistent [`Cache`] in
//! front of a batching [`Downloader`], and a [`DefermentManager`] that
//! releases each Item only after its whole closure.
//!
//! [`Cache`]: objloader_cache::Cache
//! [`Downloader`]: objloader_download::Downloader
//! [`DefermentManager`]: objloader_defer::DefermentManager

pub mod config;
pub mod error;
pub mod loader;
pub mod stream;

pub use config::LoaderConfig;
pub use error::{LoadError, LoadResult};
pub use loader::{LoadStats, ObjectLoader};
pub use stream::ItemStream;

// Re-export the types callers need to build a loader.
pub use objloader_download::{HttpObjectService, MemoryObjectService, ObjectService, ServiceEndpoint};
pub use objloader_store::{InMemoryObjectStore, LogConfig, LogObjectStore, ObjectStore};
pub use objloader_types::{Base, BaseId, Closure, Item};
