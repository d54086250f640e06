//! Acoustic receiver: demodulates a session key from a live sample feed.
//!
//! Sample-clocked state machine `Idle -> Armed -> Receiving -> Decoding -> Idle`. The host pushes
//! captured samples and polls; each poll runs one FFT per hop of available audio. All state
//! transitions happen in `analyse_window`.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::acoustic::{self, AcousticError, Symbol, ToneParams};
use crate::spectrum::{SpectrumAnalyzer, DEFAULT_FFT_SIZE};

/// Receiver tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverConfig {
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Samples between consecutive analysis windows.
    pub hop: usize,
    pub tolerance_hz: f32,
    /// Peaks below this normalised magnitude count as silence.
    pub min_magnitude: f32,
    /// Give up waiting for a START marker after this long.
    pub max_listen_ms: u32,
    /// Consecutive unreadable symbol slots before the capture is considered lost.
    pub max_missed_symbols: u32,
    pub tones: ToneParams,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            fft_size: DEFAULT_FFT_SIZE,
            hop: DEFAULT_FFT_SIZE / 4,
            tolerance_hz: 200.0,
            min_magnitude: 1e-3,
            max_listen_ms: 10_000,
            max_missed_symbols: 3,
            tones: ToneParams::default(),
        }
    }
}

/// Externally visible phase of the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Armed,
    Receiving,
    Decoding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// START marker heard; bits follow.
    MarkerDetected,
    /// Complete key recovered.
    Decoded(String),
    /// Attempt ended without a complete key. The receiver is idle again.
    Failed(AcousticError),
}

#[derive(Debug)]
enum State {
    Idle,
    Armed {
        listened: u64,
    },
    Receiving {
        /// Symbol clock origin (sample index where the START marker ended), once known.
        origin: Option<u64>,
        /// Centre of the window that first heard START.
        marker_since: u64,
        last_center: u64,
        next_symbol: u64,
        missed: u32,
        bits: Vec<bool>,
    },
    Decoding {
        bits: Vec<bool>,
    },
}

pub struct AcousticReceiver {
    config: ReceiverConfig,
    analyzer: SpectrumAnalyzer,
    state: State,
    buffer: VecDeque<f32>,
    /// Absolute sample index of `buffer[0]`.
    position: u64,
    window: Vec<f32>,
}

impl AcousticReceiver {
    pub fn new(config: ReceiverConfig) -> Result<Self, AcousticError> {
        config.tones.validate(config.sample_rate)?;
        if config.hop == 0 || config.hop > config.fft_size {
            return Err(AcousticError::InvalidParams(format!(
                "hop {} must be in 1..={}",
                config.hop, config.fft_size
            )));
        }
        let bit_samples = acoustic::samples_for(config.tones.bit_ms, config.sample_rate);
        if config.hop * 2 > bit_samples {
            return Err(AcousticError::InvalidParams(format!(
                "hop of {} samples too coarse for {} ms bits",
                config.hop, config.tones.bit_ms
            )));
        }
        let analyzer = SpectrumAnalyzer::new(config.fft_size, config.sample_rate)?;
        Ok(Self {
            config,
            analyzer,
            state: State::Idle,
            buffer: VecDeque::new(),
            position: 0,
            window: vec![0.0; config.fft_size],
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            State::Idle => Phase::Idle,
            State::Armed { .. } => Phase::Armed,
            State::Receiving { .. } => Phase::Receiving,
            State::Decoding { .. } => Phase::Decoding,
        }
    }

    /// Begin listening for a START marker. Restarts an attempt already in progress.
    pub fn start(&mut self) {
        debug!("acoustic receiver armed");
        self.buffer.clear();
        self.state = State::Armed { listened: 0 };
    }

    /// Abandon the current attempt and drop buffered audio.
    pub fn stop(&mut self) {
        self.buffer.clear();
        self.state = State::Idle;
    }

    /// Append captured mono samples. Ignored while idle.
    pub fn push_samples(&mut self, samples: &[f32]) {
        if matches!(self.state, State::Idle) {
            return;
        }
        self.buffer.extend(samples.iter().copied());
    }

    /// Analyse every full window currently buffered.
    pub fn poll(&mut self) -> Result<Vec<ReceiverEvent>, AcousticError> {
        let mut events = Vec::new();
        while !matches!(self.state, State::Idle) && self.buffer.len() >= self.config.fft_size {
            for (dst, src) in self.window.iter_mut().zip(self.buffer.iter()) {
                *dst = *src;
            }
            let center = self.position + (self.config.fft_size / 2) as u64;
            if let Some(event) = self.analyse_window(center)? {
                events.push(event);
            }
            let hop = self.config.hop.min(self.buffer.len());
            self.buffer.drain(..hop);
            self.position += hop as u64;
        }
        Ok(events)
    }

    fn symbol_at(&mut self) -> Result<Option<Symbol>, AcousticError> {
        let peak = self.analyzer.peak(&self.window)?;
        if peak.magnitude < self.config.min_magnitude {
            return Ok(None);
        }
        Ok(self
            .config
            .tones
            .classify(peak.frequency_hz, self.config.tolerance_hz))
    }

    /// One analysis cycle for the window centred at `center`. Sole owner of state transitions.
    fn analyse_window(&mut self, center: u64) -> Result<Option<ReceiverEvent>, AcousticError> {
        let bit_samples = acoustic::samples_for(self.config.tones.bit_ms, self.config.sample_rate) as u64;
        let max_listen =
            acoustic::samples_for(self.config.max_listen_ms, self.config.sample_rate) as u64;
        let marker_samples =
            acoustic::samples_for(self.config.tones.marker_ms, self.config.sample_rate) as u64;
        let hop = self.config.hop as u64;

        let state = std::mem::replace(&mut self.state, State::Idle);
        let (next, event) = match state {
            State::Idle => (State::Idle, None),
            State::Armed { listened } => {
                if self.symbol_at()? == Some(Symbol::Start) {
                    info!(sample = center, "start marker detected");
                    (
                        State::Receiving {
                            origin: None,
                            marker_since: center,
                            last_center: center,
                            next_symbol: 0,
                            missed: 0,
                            bits: Vec::new(),
                        },
                        Some(ReceiverEvent::MarkerDetected),
                    )
                } else if listened + hop >= max_listen {
                    warn!(listened_ms = self.config.max_listen_ms, "no start marker detected");
                    (
                        State::Idle,
                        Some(ReceiverEvent::Failed(AcousticError::NoMarkerDetected)),
                    )
                } else {
                    (
                        State::Armed {
                            listened: listened + hop,
                        },
                        None,
                    )
                }
            }
            State::Receiving {
                origin: None,
                marker_since,
                last_center,
                next_symbol,
                missed,
                bits,
            } => {
                let still_start = self.symbol_at()? == Some(Symbol::Start);
                if still_start && center - marker_since > 2 * marker_samples {
                    warn!(
                        held_ms = (center - marker_since) * 1000 / self.config.sample_rate as u64,
                        "start tone never ended"
                    );
                    (
                        State::Idle,
                        Some(ReceiverEvent::Failed(AcousticError::TruncatedSymbol {
                            recovered: String::new(),
                            dangling_bits: 0,
                        })),
                    )
                } else {
                    let origin = if still_start {
                        None
                    } else {
                        let origin = (last_center + center) / 2;
                        debug!(origin, "start marker ended, symbol clock running");
                        Some(origin)
                    };
                    (
                        State::Receiving {
                            origin,
                            marker_since,
                            last_center: center,
                            next_symbol,
                            missed,
                            bits,
                        },
                        None,
                    )
                }
            }
            State::Receiving {
                origin: Some(origin),
                marker_since,
                next_symbol,
                missed,
                mut bits,
                ..
            } => {
                let due = origin + next_symbol * bit_samples + bit_samples / 2;
                if center < due {
                    (
                        State::Receiving {
                            origin: Some(origin),
                            marker_since,
                            last_center: center,
                            next_symbol,
                            missed,
                            bits,
                        },
                        None,
                    )
                } else {
                    match self.symbol_at()? {
                        Some(Symbol::Stop) => {
                            debug!(bits = bits.len(), "stop marker detected");
                            (State::Decoding { bits }, None)
                        }
                        Some(symbol @ (Symbol::Zero | Symbol::One)) => {
                            bits.push(symbol == Symbol::One);
                            (
                                State::Receiving {
                                    origin: Some(origin),
                                    marker_since,
                                    last_center: center,
                                    next_symbol: next_symbol + 1,
                                    missed: 0,
                                    bits,
                                },
                                None,
                            )
                        }
                        _ if missed + 1 >= self.config.max_missed_symbols => {
                            let (recovered, dangling_bits) = acoustic::from_bits(&bits);
                            warn!(
                                bits = bits.len(),
                                "signal lost before stop marker"
                            );
                            (
                                State::Idle,
                                Some(ReceiverEvent::Failed(AcousticError::TruncatedSymbol {
                                    recovered,
                                    dangling_bits,
                                })),
                            )
                        }
                        _ => (
                            State::Receiving {
                                origin: Some(origin),
                                marker_since,
                                last_center: center,
                                next_symbol: next_symbol + 1,
                                missed: missed + 1,
                                bits,
                            },
                            None,
                        ),
                    }
                }
            }
            State::Decoding { bits } => (State::Decoding { bits }, None),
        };
        self.state = next;

        if let State::Decoding { bits } = &self.state {
            let (decoded, dangling_bits) = acoustic::from_bits(bits);
            self.state = State::Idle;
            self.buffer.clear();
            let event = if dangling_bits > 0 {
                warn!(dangling_bits, recovered = %decoded, "incomplete trailing symbol");
                ReceiverEvent::Failed(AcousticError::TruncatedSymbol {
                    recovered: decoded,
                    dangling_bits,
                })
            } else if let Some(c) = decoded.chars().find(|&c| !acoustic::is_transmittable(c)) {
                warn!(character = ?c, "decoded key is not printable ASCII");
                ReceiverEvent::Failed(AcousticError::UnsupportedCharacter(c))
            } else {
                info!(key = %decoded, "session key decoded");
                ReceiverEvent::Decoded(decoded)
            };
            return Ok(Some(event));
        }
        if matches!(self.state, State::Idle) {
            self.buffer.clear();
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::{encode_key, render, to_tones};

    fn feed(receiver: &mut AcousticReceiver, pcm: &[f32], block: usize) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();
        for chunk in pcm.chunks(block) {
            receiver.push_samples(chunk);
            events.extend(receiver.poll().unwrap());
        }
        events
    }

    fn pcm_for(key: &str, lead_in_ms: u32, tail_ms: u32) -> Vec<f32> {
        let config = ReceiverConfig::default();
        let schedule = encode_key(key, &config.tones).unwrap();
        let mut pcm = vec![0.0; acoustic::samples_for(lead_in_ms, config.sample_rate)];
        pcm.extend(render(&schedule, config.sample_rate, 0.5));
        pcm.extend(vec![0.0; acoustic::samples_for(tail_ms, config.sample_rate)]);
        pcm
    }

    #[test]
    fn decodes_exact_schedule() {
        let mut receiver = AcousticReceiver::new(ReceiverConfig::default()).unwrap();
        receiver.start();
        let events = feed(&mut receiver, &pcm_for("AB12CD", 0, 0), 480);
        assert_eq!(
            events,
            vec![
                ReceiverEvent::MarkerDetected,
                ReceiverEvent::Decoded("AB12CD".into())
            ]
        );
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn decodes_after_silence_with_odd_block_sizes() {
        let mut receiver = AcousticReceiver::new(ReceiverConfig::default()).unwrap();
        receiver.start();
        let events = feed(&mut receiver, &pcm_for("K3Y9QZ", 333, 200), 997);
        assert_eq!(events.last(), Some(&ReceiverEvent::Decoded("K3Y9QZ".into())));
    }

    #[test]
    fn missing_stop_marker_is_truncated() {
        let config = ReceiverConfig::default();
        let schedule = encode_key("AB12CD", &config.tones).unwrap().without_stop();
        let mut pcm = render(&schedule, config.sample_rate, 0.5);
        pcm.extend(vec![0.0; acoustic::samples_for(500, config.sample_rate)]);

        let mut receiver = AcousticReceiver::new(config).unwrap();
        receiver.start();
        let events = feed(&mut receiver, &pcm, 480);
        assert_eq!(
            events.last(),
            Some(&ReceiverEvent::Failed(AcousticError::TruncatedSymbol {
                recovered: "AB12CD".into(),
                dangling_bits: 0,
            }))
        );
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn silence_yields_no_marker() {
        let config = ReceiverConfig {
            max_listen_ms: 1_000,
            ..ReceiverConfig::default()
        };
        let mut receiver = AcousticReceiver::new(config).unwrap();
        receiver.start();
        let silence = vec![0.0; acoustic::samples_for(1_500, config.sample_rate)];
        let events = feed(&mut receiver, &silence, 480);
        assert_eq!(
            events,
            vec![ReceiverEvent::Failed(AcousticError::NoMarkerDetected)]
        );
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn endless_start_tone_fails() {
        let config = ReceiverConfig {
            max_listen_ms: 1_000,
            ..ReceiverConfig::default()
        };
        let held = ToneParams {
            marker_ms: 30_000,
            ..config.tones
        };
        let pcm = render(&to_tones(&[], &held).without_stop(), config.sample_rate, 0.5);

        let mut receiver = AcousticReceiver::new(config).unwrap();
        receiver.start();
        let events = feed(&mut receiver, &pcm, 480);
        assert_eq!(
            events,
            vec![
                ReceiverEvent::MarkerDetected,
                ReceiverEvent::Failed(AcousticError::TruncatedSymbol {
                    recovered: String::new(),
                    dangling_bits: 0,
                }),
            ]
        );
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn control_character_is_not_decoded() {
        let config = ReceiverConfig::default();
        // BEL, 0x07
        let bits = [false, false, false, false, false, true, true, true];
        let mut pcm = render(&to_tones(&bits, &config.tones), config.sample_rate, 0.5);
        pcm.extend(vec![0.0; acoustic::samples_for(200, config.sample_rate)]);

        let mut receiver = AcousticReceiver::new(config).unwrap();
        receiver.start();
        let events = feed(&mut receiver, &pcm, 480);
        assert_eq!(
            events.last(),
            Some(&ReceiverEvent::Failed(AcousticError::UnsupportedCharacter(
                '\u{7}'
            )))
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, ReceiverEvent::Decoded(_))));
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn idle_receiver_ignores_audio() {
        let mut receiver = AcousticReceiver::new(ReceiverConfig::default()).unwrap();
        let events = feed(&mut receiver, &pcm_for("AB", 0, 0), 480);
        assert!(events.is_empty());
        assert_eq!(receiver.phase(), Phase::Idle);
    }

    #[test]
    fn coarse_hop_rejected() {
        let config = ReceiverConfig {
            hop: 1024,
            ..ReceiverConfig::default()
        };
        assert!(matches!(
            AcousticReceiver::new(config),
            Err(AcousticError::InvalidParams(_))
        ));
    }
}
