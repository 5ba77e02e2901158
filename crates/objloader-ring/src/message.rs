use objloader_types::Item;
use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Messages exchanged between the loader and its persistence worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Persist these items (loader → worker).
    SaveBatch(Vec<Item>),
    /// Reply with `Flushed` once every earlier batch is stored (loader → worker).
    Flush { seq: u64 },
    /// All batches before the matching `Flush` are stored (worker → loader).
    Flushed { seq: u64, stored: u64 },
    /// Drain and exit (loader → worker).
    Shutdown,
}

impl WorkerMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::SaveBatch(_) => 1,
            Self::Flush { .. } => 2,
            Self::Flushed { .. } => 3,
            Self::Shutdown => 4,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SaveBatch(_) => "SaveBatch",
            Self::Flush { .. } => "Flush",
            Self::Flushed { .. } => "Flushed",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Frames a [`WorkerMessage`] as `[tag: u8][json payload]`.
///
/// The ring already length-prefixes every record, so no length is stored
/// here.
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(msg: &WorkerMessage) -> RingResult<Vec<u8>> {
        let payload = serde_json::to_vec(msg).map_err(|e| RingError::Codec(e.to_string()))?;
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> RingResult<WorkerMessage> {
        let (&tag, payload) = data
            .split_first()
            .ok_or_else(|| RingError::Codec("empty frame".into()))?;
        let msg: WorkerMessage =
            serde_json::from_slice(payload).map_err(|e| RingError::Codec(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(RingError::Codec(format!(
                "tag {tag} does not match {} payload",
                msg.type_name()
            )));
        }
        Ok(msg)
    }
}
