//! # Pitch Detection Module
//!
//! Monophonic fundamental-frequency detection used by the classical
//! estimator strategies.
//!
//! ## Features
//! - YIN pitch detection with first-dip selection against octave errors
//! - RMS noise gate and clarity check
//! - Parabolic interpolation for sub-sample accuracy
//! - Spectrum refinement for improved precision

/// Dips in the normalized difference above this value are treated as noise.
const CLARITY_THRESHOLD: f32 = 0.2;

/// Lowest frequency reported; anything below is rumble, not a note.
const MIN_FREQUENCY: f32 = 40.0;

/// A YIN estimate: frequency plus how clean the periodicity was.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YinEstimate {
    pub frequency: f32,
    /// `1 - d'(tau)` at the chosen period, in `[0, 1]`.
    pub confidence: f32,
}

/// Root mean square of a block.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|&s| s * s).sum::<f32>() / signal.len() as f32).sqrt()
}

/// YIN pitch detection.
///
/// Returns `None` for silence (RMS below `amplitude_threshold`), for noise
/// that has no clear periodicity, and for frequencies outside the audible
/// musical range.
pub fn detect_pitch_yin(
    signal: &[f32],
    sample_rate: u32,
    amplitude_threshold: f32,
) -> Option<YinEstimate> {
    let frame_size = signal.len();
    let half = frame_size / 2;
    if half < 3 || sample_rate == 0 {
        return None;
    }

    // --- Noise gate ---
    if rms(signal) < amplitude_threshold {
        return None;
    }

    // --- Difference function ---
    let mut yin_buffer = vec![0.0f32; half];
    for tau in 1..half {
        let mut diff = 0.0;
        for i in 0..half {
            let delta = signal[i] - signal[i + tau];
            diff += delta * delta;
        }
        yin_buffer[tau] = diff;
    }

    // --- Cumulative mean normalized difference ---
    let mut running_sum = 0.0;
    yin_buffer[0] = 1.0;
    for tau in 1..half {
        running_sum += yin_buffer[tau];
        if running_sum != 0.0 {
            yin_buffer[tau] *= tau as f32 / running_sum;
        } else {
            yin_buffer[tau] = 1.0;
        }
    }

    // --- First significant dip, to avoid octave errors ---
    let min_val = yin_buffer
        .iter()
        .skip(1)
        .cloned()
        .fold(f32::INFINITY, f32::min);
    let threshold = min_val + 0.05;

    let mut period = 0;
    for tau in 2..half {
        if yin_buffer[tau] < threshold && yin_buffer[tau] < yin_buffer[tau - 1] {
            period = tau;
            // Walk down to the bottom of this dip.
            while period + 1 < half && yin_buffer[period + 1] < yin_buffer[period] {
                period += 1;
            }
            break;
        }
    }

    // --- Clarity check ---
    if period == 0 || yin_buffer[period] > CLARITY_THRESHOLD {
        return None;
    }
    if period + 1 >= half {
        return None;
    }

    // --- Parabolic interpolation ---
    let y1 = yin_buffer[period - 1];
    let y2 = yin_buffer[period];
    let y3 = yin_buffer[period + 1];
    let curvature = y1 - 2.0 * y2 + y3;
    let period_float = if curvature != 0.0 {
        period as f32 + (y1 - y3) / (2.0 * curvature)
    } else {
        period as f32
    };

    let frequency = sample_rate as f32 / period_float;
    if frequency.is_finite() && frequency >= MIN_FREQUENCY {
        Some(YinEstimate {
            frequency,
            confidence: (1.0 - y2).clamp(0.0, 1.0),
        })
    } else {
        None
    }
}

/// Refines a frequency estimate using a pre-computed magnitude spectrum.
///
/// Searches two bins either side of the rough estimate and interpolates the
/// log-magnitude peak. Falls back to `rough_freq` whenever the spectrum does
/// not give a usable peak.
pub fn refine_from_spectrum(
    spectrum_magnitudes: &[f32],
    rough_freq: f32,
    sample_rate: u32,
) -> Option<f32> {
    if rough_freq <= 0.0 { return None; }
    if spectrum_magnitudes.len() < 3 { return Some(rough_freq); }
    let buffer_size = spectrum_magnitudes.len() * 2;
    let target_bin = (rough_freq * buffer_size as f32) / sample_rate as f32;
    let search_radius = 2.0;
    let start_bin = (target_bin - search_radius).max(0.0) as usize;
    let end_bin = (target_bin + search_radius).min((spectrum_magnitudes.len() - 1) as f32) as usize;
    if start_bin >= end_bin { return Some(rough_freq); }

    let peak_bin = match spectrum_magnitudes[start_bin..=end_bin]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        Some((offset, _)) => start_bin + offset,
        None => return Some(rough_freq),
    };

    if peak_bin == 0 || peak_bin >= spectrum_magnitudes.len() - 1 { return Some(rough_freq); }

    let y1 = spectrum_magnitudes[peak_bin - 1].ln();
    let y2 = spectrum_magnitudes[peak_bin].ln();
    let y3 = spectrum_magnitudes[peak_bin + 1].ln();

    if !y1.is_finite() || !y2.is_finite() || !y3.is_finite() { return Some(rough_freq); }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-6 { return Some(rough_freq); }

    let peak_shift = (y3 - y1) / (2.0 * denominator);
    let interpolated_bin = peak_bin as f32 + peak_shift;
    let final_freq = (interpolated_bin * sample_rate as f32) / buffer_size as f32;

    // A refinement that lands more than a semitone away is a different
    // partial, not a better estimate of this one.
    let ratio = final_freq / rough_freq;
    if final_freq.is_finite() && final_freq > 0.0 && (0.944..1.06).contains(&ratio) {
        Some(final_freq)
    } else {
        Some(rough_freq)
    }
}

#[cfg(test)]
pub(crate) fn sine(freq: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn yin_finds_a_220_hz_tone() {
        let signal = sine(220.0, 16_000, 1024, 0.5);
        let estimate = detect_pitch_yin(&signal, 16_000, 0.01).expect("tone should be detected");
        assert_relative_eq!(estimate.frequency, 220.0, max_relative = 0.01);
        assert!(estimate.confidence > 0.9);
    }

    #[test]
    fn yin_ignores_silence() {
        let signal = vec![0.0; 1024];
        assert_eq!(detect_pitch_yin(&signal, 16_000, 0.01), None);
        let quiet = sine(220.0, 16_000, 1024, 0.001);
        assert_eq!(detect_pitch_yin(&quiet, 16_000, 0.01), None);
    }

    #[test]
    fn yin_rejects_degenerate_input() {
        assert_eq!(detect_pitch_yin(&[0.3, -0.3], 16_000, 0.0), None);
        assert_eq!(detect_pitch_yin(&sine(220.0, 16_000, 1024, 0.5), 0, 0.01), None);
    }

    #[test]
    fn refinement_falls_back_without_a_spectrum() {
        assert_eq!(refine_from_spectrum(&[], 220.0, 16_000), Some(220.0));
        assert_eq!(refine_from_spectrum(&[1.0, 2.0, 3.0], 0.0, 16_000), None);
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        assert_relative_eq!(rms(&[1.0, -1.0, 1.0, -1.0]), 1.0);
        assert_eq!(rms(&[]), 0.0);
    }
}
