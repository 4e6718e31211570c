//! Frames exchanged between hub clients and the hub, bincode-encoded in
//! binary WebSocket messages.

use serde::{Deserialize, Serialize};

use crate::storage::LogEntry;

/// Hub wire frame.
///
/// Requests carry a client-chosen `request` id echoed by the reply
/// (`Appended`, `Entries`, `Compacted` or `Failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    // client → hub: pub/sub
    Subscribe { subscription: u64, channels: Vec<String> },
    Unsubscribe { subscription: u64 },
    Publish { channel: String, payload: Vec<u8> },

    // hub → client: pub/sub
    Message { subscription: u64, channel: String, payload: Vec<u8> },

    // client → hub: update log
    Append { request: u64, doc_name: String, update: Vec<u8> },
    List { request: u64, doc_name: String },
    Compact { request: u64, doc_name: String, merged: Vec<u8>, superseded: Vec<u64> },

    // hub → client: update log replies
    Appended { request: u64, id: u64 },
    Entries { request: u64, entries: Vec<LogEntry> },
    Compacted { request: u64, entry: LogEntry },
    Failed { request: u64, reason: String },
}

impl HubFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FrameError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(frame)
    }

    /// Request id of a log reply.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            HubFrame::Appended { request, .. }
            | HubFrame::Entries { request, .. }
            | HubFrame::Compacted { request, .. }
            | HubFrame::Failed { request, .. } => Some(*request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}
