//! Fixed-size spectral analysis: Hann-windowed real FFT and peak-bin search.

use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::acoustic::AcousticError;

/// Default FFT size (21.3 ms at 48 kHz, shorter than one bit).
pub const DEFAULT_FFT_SIZE: usize = 1024;

/// Dominant frequency of one analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub bin: usize,
    pub frequency_hz: f32,
    /// Peak amplitude normalised by the FFT size (a full-scale sine reads about 0.25).
    pub magnitude: f32,
}

pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    sample_rate: u32,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize, sample_rate: u32) -> Result<Self, AcousticError> {
        if fft_size < 16 || !fft_size.is_power_of_two() {
            return Err(AcousticError::InvalidParams(format!(
                "fft size {} must be a power of two >= 16",
                fft_size
            )));
        }
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / fft_size as f32).cos())
            .collect();
        Ok(Self {
            input: fft.make_input_vec(),
            output: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            window,
            sample_rate,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Usable frequency bins (Nyquist bin excluded).
    pub fn num_bins(&self) -> usize {
        self.fft_size() / 2
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / (2.0 * self.num_bins() as f32)
    }

    /// Peak of `samples`, which must hold exactly `fft_size` samples.
    pub fn peak(&mut self, samples: &[f32]) -> Result<Peak, AcousticError> {
        if samples.len() != self.fft_size() {
            return Err(AcousticError::Spectrum(format!(
                "expected {} samples, got {}",
                self.fft_size(),
                samples.len()
            )));
        }
        for ((dst, &s), &w) in self.input.iter_mut().zip(samples).zip(&self.window) {
            *dst = s * w;
        }
        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .map_err(|e| AcousticError::Spectrum(e.to_string()))?;

        let (bin, power) = self.output[..self.num_bins()]
            .iter()
            .map(|c| c.norm_sqr())
            .enumerate()
            .fold((0usize, 0.0f32), |best, (i, p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });
        Ok(Peak {
            bin,
            frequency_hz: self.bin_frequency(bin),
            magnitude: power.sqrt() / self.fft_size() as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn bin_to_frequency_formula() {
        let a = SpectrumAnalyzer::new(1024, 48_000).unwrap();
        assert_eq!(a.num_bins(), 512);
        assert_eq!(a.bin_frequency(416), 19_500.0);
    }

    #[test]
    fn finds_pure_tone() {
        let mut a = SpectrumAnalyzer::new(1024, 48_000).unwrap();
        for freq in [17_500.0, 18_500.0, 19_000.0, 19_500.0] {
            let peak = a.peak(&sine(freq, 48_000, 1024)).unwrap();
            assert!(
                (peak.frequency_hz - freq).abs() < 50.0,
                "{} detected as {}",
                freq,
                peak.frequency_hz
            );
            assert!(peak.magnitude > 0.05);
        }
    }

    #[test]
    fn silence_has_no_magnitude() {
        let mut a = SpectrumAnalyzer::new(1024, 48_000).unwrap();
        let peak = a.peak(&vec![0.0; 1024]).unwrap();
        assert_eq!(peak.magnitude, 0.0);
    }

    #[test]
    fn wrong_window_length_is_error() {
        let mut a = SpectrumAnalyzer::new(256, 48_000).unwrap();
        assert!(matches!(
            a.peak(&[0.0; 100]),
            Err(AcousticError::Spectrum(_))
        ));
    }

    #[test]
    fn non_power_of_two_rejected() {
        assert!(SpectrumAnalyzer::new(1000, 48_000).is_err());
    }
}
