//! WaveDrop reference implementation.
//! Host-driven: no I/O; host feeds audio, frames and negotiation events and performs returned actions.

pub mod acoustic;
pub mod core;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod relay;
pub mod session;
pub mod signal;
pub mod spectrum;
pub mod transfer;
pub mod wire;

pub use acoustic::{AcousticError, BitSequence, Symbol, Tone, ToneParams, ToneSchedule};
pub use crate::core::{
    Action, CoreError, EngineError, NegotiationEngine, NegotiationPhase, Role, ShareCore,
};
pub use protocol::{Frame, SignalKind, SignalMessage, PROTOCOL_VERSION};
pub use receiver::{AcousticReceiver, ReceiverConfig, ReceiverEvent};
pub use relay::{MemoryRelayStore, RelayError, RelayRecord, RelayStore};
pub use session::{SessionKey, SessionKeyError};
pub use signal::{CompactToken, ConnectionDescription, DescriptionKind, SignalError};
pub use spectrum::{Peak, SpectrumAnalyzer};
pub use transfer::{
    Channel, ChannelError, ReceivedFile, SendProgress, TransferError, TransferMetadata,
    TransferParams, TransferReceiver, TransferSender,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
