//! # Fast Fourier Transform (FFT) Module
//!
//! Magnitude spectra used to refine time-domain pitch estimates.
//!
//! ## Features
//! - RustFFT with a cached planner, so repeated block sizes reuse their plan
//! - Hann windowing for reduced spectral leakage
//! - DC offset removal before the transform

use rustfft::{num_complex::Complex, FftPlanner};

/// Removes the DC offset from a signal by making its average value zero.
fn remove_dc_offset(signal: &mut [f32]) {
    let len = signal.len();
    if len == 0 { return; }
    let avg = signal.iter().sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            *sample -= avg;
        }
    }
}

/// Applies a Hann window to the input buffer to reduce spectral leakage.
fn apply_hann_window(buffer: &mut [f32]) {
    let n = buffer.len();
    if n < 2 { return; }
    let n_minus_1 = (n - 1) as f32;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let multiplier = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos());
        *sample *= multiplier;
    }
}

/// Computes magnitude spectra for blocks of any length.
pub struct SpectrumAnalyzer {
    planner: FftPlanner<f32>,
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        Self { planner: FftPlanner::new() }
    }

    /// Returns the magnitudes of the first `len / 2` bins (up to Nyquist).
    ///
    /// The signal is DC-corrected and Hann-windowed on a copy; the input is
    /// left untouched.
    pub fn magnitudes(&mut self, signal: &[f32]) -> Vec<f32> {
        let len = signal.len();
        if len < 2 {
            return Vec::new();
        }

        let mut processed_signal = signal.to_vec();
        remove_dc_offset(&mut processed_signal);
        apply_hann_window(&mut processed_signal);

        let fft = self.planner.plan_fft_forward(len);
        let mut buffer: Vec<Complex<f32>> = processed_signal
            .into_iter()
            .map(|sample| Complex { re: sample, im: 0.0 })
            .collect();
        fft.process(&mut buffer);

        buffer
            .iter()
            .take(len / 2)
            .map(|c| c.norm()) // .norm() is sqrt(re^2 + im^2)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_peaks_at_its_bin() {
        let sample_rate = 16_000.0;
        let len = 1024;
        // 1000 Hz sits exactly on bin 64 at this size.
        let signal: Vec<f32> = (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / sample_rate).sin())
            .collect();
        let mags = SpectrumAnalyzer::new().magnitudes(&signal);
        assert_eq!(mags.len(), len / 2);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(64));
    }

    #[test]
    fn tiny_input_yields_empty_spectrum() {
        assert!(SpectrumAnalyzer::new().magnitudes(&[0.5]).is_empty());
    }
}
