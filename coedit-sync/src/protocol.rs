//! Binary wire protocol spoken with editor clients.
//!
//! Wire format (lib0 varints, y-protocols compatible):
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ varuint tag  │ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0 (sync)     │ varuint sub-tag • varbuf(bytes)              │
//! │              │   0 = step 1 (state vector)                  │
//! │              │   1 = step 2 (diff update)                   │
//! │              │   2 = update (incremental delta)             │
//! │ 1 (awareness)│ varbuf(encoded awareness update)             │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Anything after a complete message is ignored. Any other tag is a
//! protocol error and the connection carrying it gets closed.

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level tag for document sync messages.
pub const MSG_SYNC: u32 = 0;
/// Top-level tag for awareness messages.
pub const MSG_AWARENESS: u32 = 1;

/// Sync sub-tag: sender's state vector.
pub const SYNC_STEP1: u32 = 0;
/// Sync sub-tag: diff answering a state vector.
pub const SYNC_STEP2: u32 = 1;
/// Sync sub-tag: incremental update.
pub const SYNC_UPDATE: u32 = 2;

/// Document sync sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector; the receiver answers with [`SyncMessage::Step2`].
    Step1(Vec<u8>),
    /// Update containing everything the step 1 sender was missing.
    Step2(Vec<u8>),
    /// Incremental update delta.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn sub_tag(&self) -> u32 {
        match self {
            SyncMessage::Step1(_) => SYNC_STEP1,
            SyncMessage::Step2(_) => SYNC_STEP2,
            SyncMessage::Update(_) => SYNC_UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(p) | SyncMessage::Step2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update, see [`crate::awareness::AwarenessUpdate`].
    Awareness(Vec<u8>),
}

impl Message {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Sync(sync) => {
                buf.write_var(MSG_SYNC);
                buf.write_var(sync.sub_tag());
                buf.write_buf(sync.payload());
            }
            Message::Awareness(update) => {
                buf.write_var(MSG_AWARENESS);
                buf.write_buf(update);
            }
        }
        buf
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        match tag {
            MSG_SYNC => {
                let sub_tag: u32 = cursor.read_var()?;
                let payload = cursor.read_buf()?.to_vec();
                let sync = match sub_tag {
                    SYNC_STEP1 => SyncMessage::Step1(payload),
                    SYNC_STEP2 => SyncMessage::Step2(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(Message::Sync(sync))
            }
            MSG_AWARENESS => Ok(Message::Awareness(cursor.read_buf()?.to_vec())),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Protocol errors. Each one is fatal for the connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u32),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
