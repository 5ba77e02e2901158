use objloader_types::{BaseId, TypeError};

/// Errors from the object service and the download path.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Transport failure, or a batch that produced no usable records.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("object service returned {code}: {message}")]
    Status { code: u16, message: String },

    /// 401/403 from the service.
    #[error("you do not have access to this stream")]
    Unauthorized,

    /// The service does not know this id.
    #[error("object not found: {0}")]
    NotFound(BaseId),

    /// A response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// The decoded object is not a usable Base.
    #[error("invalid base: {0}")]
    InvalidBase(#[from] TypeError),

    /// The endpoint description cannot be turned into requests.
    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
