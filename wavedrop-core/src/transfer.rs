//! Chunked transfer: split a payload into slices sent over a message channel with backpressure,
//! and reassemble received frames into the original payload.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::integrity::{self, RunningDigest};
use crate::protocol::Frame;
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Default slice size in bytes.
pub const DEFAULT_SLICE_SIZE: usize = 16 * 1024; // 16 KiB

/// High-water mark as a multiple of the slice size.
pub const HIGH_WATER_SLICES: usize = 10;

/// Delay before re-checking a saturated channel.
pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_millis(30);

/// Sent once, before any data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub total_size: u64,
}

/// Byte range of one slice: [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub start: u64,
    pub end: u64,
}

/// Split a payload into slices by fixed size. A zero slice size falls back to the default.
pub fn split_into_slices(total_len: u64, slice_size: usize) -> Vec<SliceRange> {
    let size = if slice_size == 0 {
        DEFAULT_SLICE_SIZE as u64
    } else {
        slice_size as u64
    };
    let mut out = Vec::new();
    let mut start = 0u64;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(SliceRange { start, end });
        start = end;
    }
    out
}

/// Message-oriented channel the sender writes frames into.
pub trait Channel {
    fn is_open(&self) -> bool;
    /// Queue one encoded message. Must not block.
    fn send(&mut self, message: Vec<u8>) -> Result<(), ChannelError>;
    /// Bytes queued but not yet handed to the transport.
    fn pending_bytes(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
#[error("channel send failed: {0}")]
pub struct ChannelError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("channel is not open")]
    ChannelUnavailable,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transfer ended before metadata was received")]
    IncompleteTransfer,
    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] FrameDecodeError),
}

/// Sender tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub slice_size: usize,
    /// Stop sending while the channel holds more than this many bytes.
    pub high_water: usize,
    pub drain_delay: Duration,
}

impl TransferParams {
    /// Params for the given slice size with the high-water mark scaled to match.
    pub fn with_slice_size(slice_size: usize) -> Self {
        let slice_size = if slice_size == 0 {
            DEFAULT_SLICE_SIZE
        } else {
            slice_size
        };
        Self {
            slice_size,
            high_water: slice_size * HIGH_WATER_SLICES,
            drain_delay: DEFAULT_DRAIN_DELAY,
        }
    }
}

impl Default for TransferParams {
    fn default() -> Self {
        Self::with_slice_size(DEFAULT_SLICE_SIZE)
    }
}

/// Outcome of one `pump` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Channel saturated; call `pump` again after `retry_after`.
    Blocked { retry_after: Duration },
    /// Meta, all data and End have been queued.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStage {
    Meta,
    Data,
    End,
    Done,
}

/// Single-producer send loop. The host calls `pump` until `Done`, sleeping between `Blocked` results.
pub struct TransferSender {
    metadata: TransferMetadata,
    payload: Vec<u8>,
    digest: [u8; 32],
    slices: Vec<SliceRange>,
    next_slice: usize,
    stage: SendStage,
    params: TransferParams,
}

impl TransferSender {
    pub fn new(name: impl Into<String>, payload: Vec<u8>, params: TransferParams) -> Self {
        let total_size = payload.len() as u64;
        let slices = split_into_slices(total_size, params.slice_size);
        let digest = integrity::hash_payload(&payload);
        Self {
            metadata: TransferMetadata {
                name: name.into(),
                total_size,
            },
            payload,
            digest,
            slices,
            next_slice: 0,
            stage: SendStage::Meta,
            params,
        }
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    /// Payload bytes handed to the channel so far.
    pub fn bytes_sent(&self) -> u64 {
        match self.next_slice {
            0 => 0,
            n => self.slices[n - 1].end,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == SendStage::Done
    }

    /// Send as much as the channel accepts. Checks the gauge before every slice, so at most one
    /// slice is queued past the high-water mark.
    pub fn pump<C: Channel + ?Sized>(
        &mut self,
        channel: &mut C,
    ) -> Result<SendProgress, TransferError> {
        if self.stage == SendStage::Done {
            return Ok(SendProgress::Done);
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelUnavailable);
        }

        if self.stage == SendStage::Meta {
            let frame = wire::encode_frame(&Frame::Meta(self.metadata.clone()))?;
            channel.send(frame)?;
            debug!(
                name = %self.metadata.name,
                size = self.metadata.total_size,
                "sent transfer metadata"
            );
            self.stage = SendStage::Data;
        }

        while self.stage == SendStage::Data {
            let Some(range) = self.slices.get(self.next_slice).copied() else {
                self.stage = SendStage::End;
                break;
            };
            let pending = channel.pending_bytes();
            if pending > self.params.high_water {
                debug!(
                    pending,
                    high_water = self.params.high_water,
                    "channel saturated, waiting to drain"
                );
                return Ok(SendProgress::Blocked {
                    retry_after: self.params.drain_delay,
                });
            }
            let bytes = self.payload[range.start as usize..range.end as usize].to_vec();
            let frame = wire::encode_frame(&Frame::Data {
                offset: range.start,
                bytes,
            })?;
            channel.send(frame)?;
            self.next_slice += 1;
        }

        if self.stage == SendStage::End {
            let frame = wire::encode_frame(&Frame::End {
                digest: self.digest,
            })?;
            channel.send(frame)?;
            self.stage = SendStage::Done;
            info!(
                name = %self.metadata.name,
                size = self.metadata.total_size,
                slices = self.slices.len(),
                "transfer sent"
            );
        }
        Ok(SendProgress::Done)
    }
}

/// Reassembled payload, tagged with its declared metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
}

/// Receiver side of one transfer. Terminal after End or after any protocol error.
#[derive(Default)]
pub struct TransferReceiver {
    metadata: Option<TransferMetadata>,
    buffer: Vec<Vec<u8>>,
    digest: RunningDigest,
    finished: bool,
}

impl TransferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.metadata.as_ref()
    }

    /// Payload bytes buffered so far.
    pub fn received_bytes(&self) -> u64 {
        self.digest.bytes_hashed()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decode one wire message and process it. A message carries exactly one frame.
    pub fn on_message(&mut self, bytes: &[u8]) -> Result<Option<ReceivedFile>, TransferError> {
        if self.finished {
            debug!(len = bytes.len(), "ignoring message after end of transfer");
            return Ok(None);
        }
        let (frame, consumed) = wire::decode_frame::<Frame>(bytes)?;
        if consumed != bytes.len() {
            return Err(self.abort(TransferError::ProtocolViolation(format!(
                "{} trailing bytes after frame",
                bytes.len() - consumed
            ))));
        }
        self.on_frame(frame)
    }

    /// Process one frame. Returns the payload once End arrives.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Option<ReceivedFile>, TransferError> {
        if self.finished {
            debug!("ignoring frame after end of transfer");
            return Ok(None);
        }
        match frame {
            Frame::Meta(meta) => {
                if self.metadata.is_some() {
                    return Err(self.abort(TransferError::ProtocolViolation(
                        "duplicate metadata before end".into(),
                    )));
                }
                debug!(name = %meta.name, size = meta.total_size, "transfer metadata received");
                self.buffer.reserve(
                    (meta.total_size as usize).div_ceil(DEFAULT_SLICE_SIZE).min(1024),
                );
                self.metadata = Some(meta);
                Ok(None)
            }
            Frame::Data { offset, bytes } => {
                let Some(total_size) = self.metadata.as_ref().map(|m| m.total_size) else {
                    return Err(self.abort(TransferError::ProtocolViolation(
                        "data before metadata".into(),
                    )));
                };
                let received = self.digest.bytes_hashed();
                if offset != received {
                    return Err(self.abort(TransferError::ProtocolViolation(format!(
                        "expected offset {}, got {}",
                        received, offset
                    ))));
                }
                let end = received + bytes.len() as u64;
                if end > total_size {
                    return Err(self.abort(TransferError::ProtocolViolation(format!(
                        "data runs to {} past declared size {}",
                        end, total_size
                    ))));
                }
                self.digest.update(&bytes);
                self.buffer.push(bytes);
                Ok(None)
            }
            Frame::End { digest } => {
                let Some(meta) = self.metadata.take() else {
                    return Err(self.abort(TransferError::IncompleteTransfer));
                };
                self.finished = true;
                let received = self.digest.bytes_hashed();
                if received != meta.total_size {
                    let err = TransferError::IntegrityFailed(format!(
                        "received {} of {} bytes",
                        received, meta.total_size
                    ));
                    return Err(self.abort(err));
                }
                if !std::mem::take(&mut self.digest).verify(&digest) {
                    return Err(self.abort(TransferError::IntegrityFailed(
                        "digest mismatch".into(),
                    )));
                }
                let bytes = std::mem::take(&mut self.buffer).concat();
                info!(name = %meta.name, size = meta.total_size, "transfer received");
                Ok(Some(ReceivedFile {
                    name: meta.name,
                    size: meta.total_size,
                    bytes,
                }))
            }
        }
    }

    /// Drop buffered state and make the receiver terminal.
    fn abort(&mut self, err: TransferError) -> TransferError {
        warn!(error = %err, received = self.digest.bytes_hashed(), "aborting transfer");
        self.finished = true;
        self.metadata = None;
        self.buffer.clear();
        self.digest = RunningDigest::new();
        err
    }
}
