//! Acoustic symbol codec: session key <-> bits <-> tone schedule, plus sine rendering for playback.
//!
//! Frequency-shift keying with two data tones and two marker tones, all near the top of the
//! audible band.

use std::f32::consts::TAU;

/// Ordered bits, 8 per character, most significant first.
pub type BitSequence = Vec<bool>;

/// Minimum spacing between any two tone frequencies.
pub const MIN_TONE_SPACING_HZ: f32 = 300.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcousticError {
    #[error("unsupported character {0:?} (printable ASCII only)")]
    UnsupportedCharacter(char),
    #[error("invalid tone parameters: {0}")]
    InvalidParams(String),
    #[error("no start marker detected within the listening window")]
    NoMarkerDetected,
    #[error("transmission truncated: recovered {recovered:?}, {dangling_bits} dangling bits")]
    TruncatedSymbol {
        recovered: String,
        dangling_bits: usize,
    },
    #[error("spectrum analysis failed: {0}")]
    Spectrum(String),
}

/// What a tone stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Start,
    Zero,
    One,
    Stop,
}

/// One entry of a tone schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub symbol: Symbol,
    pub frequency_hz: f32,
    pub duration_ms: u32,
}

/// Frequencies and durations of the four symbols.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneParams {
    pub start_hz: f32,
    pub zero_hz: f32,
    pub one_hz: f32,
    pub stop_hz: f32,
    pub marker_ms: u32,
    pub bit_ms: u32,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            start_hz: 19_500.0,
            zero_hz: 18_500.0,
            one_hz: 19_000.0,
            stop_hz: 17_500.0,
            marker_ms: 120,
            bit_ms: 40,
        }
    }
}

impl ToneParams {
    pub fn frequency(&self, symbol: Symbol) -> f32 {
        match symbol {
            Symbol::Start => self.start_hz,
            Symbol::Zero => self.zero_hz,
            Symbol::One => self.one_hz,
            Symbol::Stop => self.stop_hz,
        }
    }

    /// Check spacing, Nyquist limit and durations for the given sample rate.
    pub fn validate(&self, sample_rate: u32) -> Result<(), AcousticError> {
        if self.marker_ms == 0 || self.bit_ms == 0 {
            return Err(AcousticError::InvalidParams("zero duration".into()));
        }
        let nyquist = sample_rate as f32 / 2.0;
        let freqs = [
            (Symbol::Start, self.start_hz),
            (Symbol::Zero, self.zero_hz),
            (Symbol::One, self.one_hz),
            (Symbol::Stop, self.stop_hz),
        ];
        for (i, (a, fa)) in freqs.iter().enumerate() {
            if *fa <= 0.0 || *fa >= nyquist {
                return Err(AcousticError::InvalidParams(format!(
                    "{:?} tone {} Hz outside (0, {}) Hz",
                    a, fa, nyquist
                )));
            }
            for (b, fb) in &freqs[i + 1..] {
                if (fa - fb).abs() < MIN_TONE_SPACING_HZ {
                    return Err(AcousticError::InvalidParams(format!(
                        "{:?} and {:?} tones only {} Hz apart",
                        a,
                        b,
                        (fa - fb).abs()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Nearest symbol to `frequency_hz` within `tolerance_hz`, if any.
    pub fn classify(&self, frequency_hz: f32, tolerance_hz: f32) -> Option<Symbol> {
        [Symbol::Start, Symbol::Zero, Symbol::One, Symbol::Stop]
            .into_iter()
            .map(|s| (s, (self.frequency(s) - frequency_hz).abs()))
            .filter(|(_, d)| *d <= tolerance_hz)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| s)
    }
}

/// START, one tone per bit, STOP.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSchedule {
    tones: Vec<Tone>,
}

impl ToneSchedule {
    pub fn tones(&self) -> &[Tone] {
        &self.tones
    }

    pub fn len(&self) -> usize {
        self.tones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tones.is_empty()
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.tones.iter().map(|t| t.duration_ms as u64).sum()
    }

    /// Same schedule with the trailing STOP marker removed.
    pub fn without_stop(mut self) -> Self {
        if matches!(self.tones.last(), Some(t) if t.symbol == Symbol::Stop) {
            self.tones.pop();
        }
        self
    }
}

/// Printable ASCII, space included.
pub fn is_transmittable(c: char) -> bool {
    (' '..='~').contains(&c)
}

/// Bits of a printable-ASCII string, MSB first.
pub fn to_bits(s: &str) -> Result<BitSequence, AcousticError> {
    let mut bits = Vec::with_capacity(s.len() * 8);
    for c in s.chars() {
        if !is_transmittable(c) {
            return Err(AcousticError::UnsupportedCharacter(c));
        }
        let code = c as u8;
        bits.extend((0..8).rev().map(|i| (code >> i) & 1 == 1));
    }
    Ok(bits)
}

/// Regroup bits into characters. Returns the string and the count of bits left over
/// in an incomplete trailing group.
pub fn from_bits(bits: &[bool]) -> (String, usize) {
    let chunks = bits.chunks_exact(8);
    let dangling = chunks.remainder().len();
    let s = chunks
        .map(|byte| byte.iter().fold(0u8, |acc, &b| (acc << 1) | b as u8))
        .map(char::from)
        .collect();
    (s, dangling)
}

/// Tone schedule for a bit sequence.
pub fn to_tones(bits: &[bool], params: &ToneParams) -> ToneSchedule {
    let mut tones = Vec::with_capacity(bits.len() + 2);
    tones.push(Tone {
        symbol: Symbol::Start,
        frequency_hz: params.start_hz,
        duration_ms: params.marker_ms,
    });
    tones.extend(bits.iter().map(|&bit| {
        let symbol = if bit { Symbol::One } else { Symbol::Zero };
        Tone {
            symbol,
            frequency_hz: params.frequency(symbol),
            duration_ms: params.bit_ms,
        }
    }));
    tones.push(Tone {
        symbol: Symbol::Stop,
        frequency_hz: params.stop_hz,
        duration_ms: params.marker_ms,
    });
    ToneSchedule { tones }
}

/// Schedule for a session key in one step.
pub fn encode_key(key: &str, params: &ToneParams) -> Result<ToneSchedule, AcousticError> {
    Ok(to_tones(&to_bits(key)?, params))
}

/// Number of samples a tone of `duration_ms` occupies.
pub fn samples_for(duration_ms: u32, sample_rate: u32) -> usize {
    (duration_ms as u64 * sample_rate as u64 / 1000) as usize
}

/// Render a schedule to mono PCM, tones back to back with no gaps.
pub fn render(schedule: &ToneSchedule, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let total: usize = schedule
        .tones
        .iter()
        .map(|t| samples_for(t.duration_ms, sample_rate))
        .sum();
    let mut out = Vec::with_capacity(total);
    let mut phase = 0.0f32;
    for tone in &schedule.tones {
        let step = TAU * tone.frequency_hz / sample_rate as f32;
        for _ in 0..samples_for(tone.duration_ms, sample_rate) {
            out.push(amplitude * phase.sin());
            phase = (phase + step) % TAU;
        }
    }
    out
}
