/// Errors from ring buffer transport operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    /// The wait for free space or data expired. Advisory: retry or back off.
    #[error("ring buffer wait timed out")]
    Timeout,

    /// The record can never fit in the data region.
    #[error("message of {size} bytes exceeds ring capacity {capacity}")]
    MessageTooLarge { size: usize, capacity: usize },

    /// The capacity is too small to hold even an empty record.
    #[error("invalid ring capacity {0}")]
    InvalidCapacity(usize),

    /// The producer or consumer side of this buffer is already attached.
    #[error("{0} role already attached to this ring buffer")]
    RoleTaken(&'static str),

    /// A message could not be framed or decoded.
    #[error("message codec error: {0}")]
    Codec(String),
}

pub type RingResult<T> = Result<T, RingError>;
