//! Persistent storage for resolved Items.
//!
//! The loader treats its store as an opaque key-value map keyed by
//! [`BaseId`](objloader_types::BaseId). Because ids are content hashes,
//! entries never change and never need invalidation.
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectStore`] trait:
//!
//! - [`InMemoryObjectStore`] -- `HashMap`-based store for tests and embedding
//! - [`LogObjectStore`] -- append-only, checksummed log file with an
//!   in-memory index rebuilt on open

pub mod error;
pub mod log;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use log::{LogConfig, LogObjectStore, SyncMode};
pub use memory::InMemoryObjectStore;
pub use traits::ObjectStore;
