use thiserror::Error;

/// Errors produced while validating Base and Item values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("base is not a JSON object")]
    NotAnObject,

    #[error("base has no `id` field")]
    MissingId,

    #[error("invalid base id: {0}")]
    InvalidId(String),

    #[error("invalid __closure on {id}: {reason}")]
    InvalidClosure { id: String, reason: String },

    #[error("item id mismatch: baseId {expected}, base.id {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("json error: {0}")]
    Json(String),
}
