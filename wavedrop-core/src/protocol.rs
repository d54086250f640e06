//! WaveDrop wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::transfer::TransferMetadata;

/// Current protocol version. Carried in broadcast signaling messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Transfer frames. Encoding is bincode; framing is length-prefix (see wire module).
///
/// A transfer is exactly one `Meta`, then `Data` frames with contiguous offsets, then one `End`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Name and size of the payload about to be streamed.
    Meta(TransferMetadata),
    /// One slice of the payload starting at `offset`.
    Data { offset: u64, bytes: Vec<u8> },
    /// Transfer finished; SHA-256 of the whole payload.
    End { digest: [u8; 32] },
}

/// Which half of the negotiation a signaling message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// Broadcast signaling message: `{kind, key, payload}`. Payload is a compact token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub protocol_version: u8,
    pub kind: SignalKind,
    pub key: String,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            kind,
            key: key.into(),
            payload: payload.into(),
        }
    }
}
