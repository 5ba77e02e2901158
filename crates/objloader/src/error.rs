use objloader_cache::CacheError;
use objloader_defer::DeferError;
use objloader_download::DownloadError;
use objloader_types::BaseId;
use thiserror::Error;

/// Errors surfaced by [`ObjectLoader`](crate::ObjectLoader) and its item stream.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("object not found: {0}")]
    NotFound(BaseId),

    #[error("cycle or missing dependency at {id}: {reason}")]
    CycleOrMissingDependency { id: BaseId, reason: String },

    /// A dependency failed; carries the missing id and the chain to it.
    #[error(transparent)]
    Dependency(DeferError),

    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("item stream already taken")]
    AlreadyConsumed,

    #[error("loader is shut down")]
    Closed,
}

impl LoadError {
    /// The object this error is about, when there is one.
    pub fn id(&self) -> Option<&BaseId> {
        match self {
            Self::NotFound(id) => Some(id),
            Self::CycleOrMissingDependency { id, .. } => Some(id),
            Self::Dependency(e) => Some(e.id()),
            Self::Download(DownloadError::NotFound(id)) => Some(id),
            _ => None,
        }
    }
}

impl From<DeferError> for LoadError {
    fn from(err: DeferError) -> Self {
        match err {
            DeferError::NotFound(id) => Self::NotFound(id),
            DeferError::CycleOrMissingDependency { id, reason } => {
                Self::CycleOrMissingDependency { id, reason }
            }
            other => Self::Dependency(other),
        }
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
