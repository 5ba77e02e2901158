/// Errors from queue construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid batch configuration: {0}")]
    InvalidConfig(String),

    #[error("batching queue must be created inside a tokio runtime")]
    NoRuntime,
}

pub type QueueResult<T> = Result<T, QueueError>;
