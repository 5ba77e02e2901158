use objloader_types::BaseId;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored bytes for an id cannot be decoded or fail their checksum.
    #[error("corrupt entry {id}: {reason}")]
    Corrupt { id: BaseId, reason: String },

    /// Storage backend is read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// Storage backend refused the operation (quota, closed handle, ...).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
