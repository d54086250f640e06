//! Host-driven API: ShareCore receives negotiation events from the host, returns actions.
//!
//! Sender: `start_sender` -> gathering -> publish offer + announce key -> apply answer -> channel open.
//! Receiver: `start_receiver` -> offer arrives -> answer -> gathering -> publish answer -> channel open.

use tracing::{debug, info, warn};

use crate::protocol::{SignalKind, SignalMessage, PROTOCOL_VERSION};
use crate::session::SessionKey;
use crate::signal::{self, ConnectionDescription, DescriptionKind, SignalError};
use crate::transfer::{TransferParams, TransferReceiver, TransferSender};

/// Default ticks to wait for candidate gathering before giving up.
pub const DEFAULT_GATHERING_TIMEOUT_TICKS: u64 = 15;

/// Label of the data channel the sender opens.
pub const CHANNEL_LABEL: &str = "file";

/// Opaque failure reported by the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("negotiation engine: {0}")]
pub struct EngineError(pub String);

/// The external real-time engine (offer/answer/ICE). Only these calls are used.
pub trait NegotiationEngine {
    fn create_offer(&mut self) -> Result<ConnectionDescription, EngineError>;
    fn create_answer(
        &mut self,
        remote: &ConnectionDescription,
    ) -> Result<ConnectionDescription, EngineError>;
    fn set_local_description(
        &mut self,
        description: &ConnectionDescription,
    ) -> Result<(), EngineError>;
    fn set_remote_description(
        &mut self,
        description: &ConnectionDescription,
    ) -> Result<(), EngineError>;
    /// Local description with gathered candidates. Read after gathering completes.
    fn local_description(&self) -> Option<ConnectionDescription>;
    fn open_channel(&mut self, label: &str) -> Result<(), EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("expected {expected:?} description, got {got:?}")]
    UnexpectedDescription {
        expected: DescriptionKind,
        got: DescriptionKind,
    },
    #[error("cannot {0} while negotiation is in progress")]
    Busy(&'static str),
    #[error("candidate gathering timed out")]
    GatheringTimeout,
    #[error("channel is not open")]
    ChannelUnavailable,
}

/// Where the negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    GatheringOffer,
    AwaitingAnswer,
    AwaitingOffer,
    GatheringAnswer,
    AwaitingChannel,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Action for host to perform.
#[derive(Debug)]
pub enum Action {
    /// Send over the local broadcast and/or the relay store.
    Publish(SignalMessage),
    /// Show or play the session key (QR, text, tones).
    AnnounceKey(SessionKey),
    /// Fetch the offer stored under this key and pass it to `on_signal`.
    LookupOffer(SessionKey),
    ChannelOpen,
    ChannelClosed,
    Failed(CoreError),
}

enum Negotiation {
    Idle,
    GatheringOffer { key: SessionKey, since: u64 },
    AwaitingAnswer { key: SessionKey },
    AwaitingOffer { key: SessionKey },
    GatheringAnswer { key: SessionKey, since: u64 },
    AwaitingChannel { key: SessionKey },
    Connected { key: SessionKey },
    Closed,
    Failed,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ShareCore {
    state: Negotiation,
    role: Option<Role>,
    /// Receiver only: the sender's data channel has been announced by the engine.
    incoming_channel: bool,
    tick_count: u64,
    gathering_timeout_ticks: u64,
}

impl ShareCore {
    pub fn new() -> Self {
        Self {
            state: Negotiation::Idle,
            role: None,
            incoming_channel: false,
            tick_count: 0,
            gathering_timeout_ticks: DEFAULT_GATHERING_TIMEOUT_TICKS,
        }
    }

    /// Set custom gathering timeout in ticks.
    pub fn set_gathering_timeout(&mut self, ticks: u64) {
        self.gathering_timeout_ticks = ticks;
    }

    pub fn phase(&self) -> NegotiationPhase {
        match self.state {
            Negotiation::Idle => NegotiationPhase::Idle,
            Negotiation::GatheringOffer { .. } => NegotiationPhase::GatheringOffer,
            Negotiation::AwaitingAnswer { .. } => NegotiationPhase::AwaitingAnswer,
            Negotiation::AwaitingOffer { .. } => NegotiationPhase::AwaitingOffer,
            Negotiation::GatheringAnswer { .. } => NegotiationPhase::GatheringAnswer,
            Negotiation::AwaitingChannel { .. } => NegotiationPhase::AwaitingChannel,
            Negotiation::Connected { .. } => NegotiationPhase::Connected,
            Negotiation::Closed => NegotiationPhase::Closed,
            Negotiation::Failed => NegotiationPhase::Failed,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        match &self.state {
            Negotiation::GatheringOffer { key, .. }
            | Negotiation::AwaitingAnswer { key }
            | Negotiation::AwaitingOffer { key }
            | Negotiation::GatheringAnswer { key, .. }
            | Negotiation::AwaitingChannel { key }
            | Negotiation::Connected { key } => Some(key),
            _ => None,
        }
    }

    pub fn is_channel_open(&self) -> bool {
        matches!(self.state, Negotiation::Connected { .. })
    }

    fn ensure_startable(&self, what: &'static str) -> Result<(), CoreError> {
        match self.state {
            Negotiation::Idle | Negotiation::Closed | Negotiation::Failed => Ok(()),
            _ => Err(CoreError::Busy(what)),
        }
    }

    /// Begin as sender with a fresh session key.
    pub fn start_sender<E: NegotiationEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<Vec<Action>, CoreError> {
        self.start_sender_with_key(engine, SessionKey::generate())
    }

    /// Begin as sender: open the data channel, create and apply the offer, then wait for gathering.
    pub fn start_sender_with_key<E: NegotiationEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        key: SessionKey,
    ) -> Result<Vec<Action>, CoreError> {
        self.ensure_startable("start sending")?;
        self.role = Some(Role::Sender);
        self.incoming_channel = false;
        let result = engine.open_channel(CHANNEL_LABEL).and_then(|()| {
            let offer = engine.create_offer()?;
            engine.set_local_description(&offer)
        });
        if let Err(e) = result {
            return Err(self.fail(e.into()));
        }
        info!(key = %key, "offer created, gathering candidates");
        self.state = Negotiation::GatheringOffer {
            key,
            since: self.tick_count,
        };
        Ok(Vec::new())
    }

    /// Begin as receiver for a key obtained out of band.
    pub fn start_receiver(&mut self, key: SessionKey) -> Result<Vec<Action>, CoreError> {
        self.ensure_startable("start receiving")?;
        self.role = Some(Role::Receiver);
        self.incoming_channel = false;
        info!(key = %key, "looking up offer");
        self.state = Negotiation::AwaitingOffer { key: key.clone() };
        Ok(vec![Action::LookupOffer(key)])
    }

    /// Engine finished gathering candidates: publish whichever description we were building.
    pub fn on_ice_gathering_complete<E: NegotiationEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<Vec<Action>, CoreError> {
        let (key, kind) = match &self.state {
            Negotiation::GatheringOffer { key, .. } => (key.clone(), SignalKind::Offer),
            Negotiation::GatheringAnswer { key, .. } => (key.clone(), SignalKind::Answer),
            _ => {
                debug!(phase = ?self.phase(), "ignoring gathering-complete outside gathering");
                return Ok(Vec::new());
            }
        };
        let Some(local) = engine.local_description() else {
            return Err(self.fail(EngineError("no local description after gathering".into()).into()));
        };
        let token = match signal::encode(&local) {
            Ok(t) => t,
            Err(e) => return Err(self.fail(e.into())),
        };
        match kind {
            SignalKind::Offer => {
                info!(key = %key, token_len = token.as_str().len(), "offer ready");
                self.state = Negotiation::AwaitingAnswer { key: key.clone() };
                Ok(vec![
                    Action::Publish(SignalMessage::new(
                        SignalKind::Offer,
                        key.as_str(),
                        token.into_string(),
                    )),
                    Action::AnnounceKey(key),
                ])
            }
            SignalKind::Answer => {
                let answer_key = key.answer_key();
                info!(key = %answer_key, "answer ready");
                self.state = Negotiation::AwaitingChannel { key };
                Ok(vec![Action::Publish(SignalMessage::new(
                    SignalKind::Answer,
                    answer_key,
                    token.into_string(),
                ))])
            }
        }
    }

    /// A signaling message arrived (broadcast, relay lookup, scanned QR).
    /// Messages for other keys or the wrong phase are ignored.
    pub fn on_signal<E: NegotiationEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        msg: &SignalMessage,
    ) -> Result<Vec<Action>, CoreError> {
        if msg.protocol_version != PROTOCOL_VERSION {
            debug!(version = msg.protocol_version, "ignoring signal with foreign protocol version");
            return Ok(Vec::new());
        }
        match (&self.state, msg.kind) {
            (Negotiation::AwaitingOffer { key }, SignalKind::Offer) if msg.key == key.as_str() => {
                let key = key.clone();
                let offer = decode_expecting(&msg.payload, DescriptionKind::Offer)?;
                let result = engine.set_remote_description(&offer).and_then(|()| {
                    let answer = engine.create_answer(&offer)?;
                    engine.set_local_description(&answer)
                });
                if let Err(e) = result {
                    return Err(self.fail(e.into()));
                }
                info!(key = %key, "offer applied, gathering candidates for answer");
                self.state = Negotiation::GatheringAnswer {
                    key,
                    since: self.tick_count,
                };
                Ok(Vec::new())
            }
            (Negotiation::AwaitingAnswer { key }, SignalKind::Answer)
                if msg.key == key.answer_key() =>
            {
                let key = key.clone();
                let answer = decode_expecting(&msg.payload, DescriptionKind::Answer)?;
                if let Err(e) = engine.set_remote_description(&answer) {
                    return Err(self.fail(e.into()));
                }
                info!(key = %key, "answer applied, waiting for channel");
                self.state = Negotiation::AwaitingChannel { key };
                Ok(Vec::new())
            }
            _ => {
                debug!(kind = ?msg.kind, key = %msg.key, phase = ?self.phase(), "ignoring signal");
                Ok(Vec::new())
            }
        }
    }

    /// Receiver side: the engine announced the sender's data channel. Other labels are ignored.
    pub fn on_incoming_channel(&mut self, label: &str) {
        if label != CHANNEL_LABEL {
            warn!(label, "ignoring channel with unexpected label");
            return;
        }
        if self.role != Some(Role::Receiver) {
            warn!(label, role = ?self.role, "incoming channel outside receiver flow");
            return;
        }
        debug!(label, "incoming channel");
        self.incoming_channel = true;
    }

    /// The data channel opened. A receiver only accepts it once the sender's channel was announced.
    pub fn on_channel_open(&mut self) -> Vec<Action> {
        if self.role == Some(Role::Receiver) && !self.incoming_channel {
            warn!(phase = ?self.phase(), "channel opened before the sender's channel arrived");
            return Vec::new();
        }
        match std::mem::replace(&mut self.state, Negotiation::Idle) {
            Negotiation::AwaitingChannel { key } => {
                info!(key = %key, "channel open");
                self.state = Negotiation::Connected { key };
                vec![Action::ChannelOpen]
            }
            other => {
                self.state = other;
                warn!(phase = ?self.phase(), "channel opened outside negotiation");
                Vec::new()
            }
        }
    }

    pub fn on_channel_close(&mut self) -> Vec<Action> {
        match self.state {
            Negotiation::Connected { .. } | Negotiation::AwaitingChannel { .. } => {
                info!("channel closed");
                self.state = Negotiation::Closed;
                vec![Action::ChannelClosed]
            }
            _ => Vec::new(),
        }
    }

    /// Periodic tick: enforce the gathering timeout.
    pub fn tick(&mut self) -> Vec<Action> {
        self.tick_count = self.tick_count.saturating_add(1);
        let since = match self.state {
            Negotiation::GatheringOffer { since, .. } | Negotiation::GatheringAnswer { since, .. } => {
                since
            }
            _ => return Vec::new(),
        };
        if self.tick_count.saturating_sub(since) > self.gathering_timeout_ticks {
            vec![Action::Failed(self.fail(CoreError::GatheringTimeout))]
        } else {
            Vec::new()
        }
    }

    /// Start streaming a payload. Requires an open channel.
    pub fn start_transfer(
        &self,
        name: impl Into<String>,
        payload: Vec<u8>,
        params: TransferParams,
    ) -> Result<TransferSender, CoreError> {
        if !self.is_channel_open() {
            return Err(CoreError::ChannelUnavailable);
        }
        Ok(TransferSender::new(name, payload, params))
    }

    /// Prepare to receive one payload. Requires an open channel.
    pub fn accept_transfer(&self) -> Result<TransferReceiver, CoreError> {
        if !self.is_channel_open() {
            return Err(CoreError::ChannelUnavailable);
        }
        Ok(TransferReceiver::new())
    }

    fn fail(&mut self, err: CoreError) -> CoreError {
        warn!(error = %err, phase = ?self.phase(), "negotiation failed");
        self.state = Negotiation::Failed;
        err
    }
}

impl Default for ShareCore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_expecting(
    payload: &str,
    expected: DescriptionKind,
) -> Result<ConnectionDescription, CoreError> {
    let description = signal::decode(payload)?;
    if description.kind != expected {
        return Err(CoreError::UnexpectedDescription {
            expected,
            got: description.kind,
        });
    }
    Ok(description)
}
