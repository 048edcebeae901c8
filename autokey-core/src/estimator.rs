//! Pluggable pitch estimation strategies.
//!
//! The analysis thread accumulates mono samples until it holds
//! [`PitchEstimator::block_len`] of them, then hands exactly that many to
//! [`PitchEstimator::estimate`]. Strategies differ only in how much audio
//! they want per call and how many observations they return.

use std::sync::Arc;

use crate::config::{DetectorConfig, EstimatorKind};
use crate::error::Result;
use crate::fft::SpectrumAnalyzer;
use crate::notes::PitchClass;
use crate::pitch::{detect_pitch_yin, refine_from_spectrum};

/// One voiced pitch reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchObservation {
    pub frequency: f32,
    /// Estimator certainty in `[0, 1]`.
    pub confidence: f32,
    /// Position of the reading inside the estimated block, in seconds.
    pub offset_secs: f32,
}

impl PitchObservation {
    /// Pitch class of this reading, or `None` when it carries no valid note.
    pub fn pitch_class(&self) -> Option<PitchClass> {
        PitchClass::from_frequency(self.frequency)
    }
}

pub trait PitchEstimator: Send {
    fn name(&self) -> &'static str;

    /// Samples the estimator wants per call at the given rate.
    fn block_len(&self, sample_rate: u32) -> usize;

    /// The rate this estimator was tuned for, if it has one. Capture
    /// backends request it; estimators still accept whatever rate arrives.
    fn preferred_sample_rate(&self) -> Option<u32> {
        None
    }

    fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<PitchObservation>>;
}

/// Builds a fresh estimator for every detector run.
pub type EstimatorFactory = Arc<dyn Fn() -> Box<dyn PitchEstimator> + Send + Sync>;

/// The factory for the strategy named in `config`.
pub fn factory_for(config: &DetectorConfig) -> EstimatorFactory {
    let config = config.clone();
    match config.estimator {
        EstimatorKind::Batched => Arc::new(move || {
            Box::new(BatchedEstimator::from_config(&config)) as Box<dyn PitchEstimator>
        }),
        EstimatorKind::LowLatency => Arc::new(move || {
            Box::new(LowLatencyEstimator::from_config(&config)) as Box<dyn PitchEstimator>
        }),
    }
}

/// One YIN estimate per block, refined against the block's spectrum.
pub struct LowLatencyEstimator {
    block_size: usize,
    amplitude_threshold: f32,
    spectrum: SpectrumAnalyzer,
}

impl LowLatencyEstimator {
    pub fn new(block_size: usize, amplitude_threshold: f32) -> Self {
        Self {
            block_size: block_size.max(64),
            amplitude_threshold,
            spectrum: SpectrumAnalyzer::new(),
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(config.block_size, config.amplitude_threshold)
    }
}

impl PitchEstimator for LowLatencyEstimator {
    fn name(&self) -> &'static str {
        "low-latency"
    }

    fn block_len(&self, _sample_rate: u32) -> usize {
        self.block_size
    }

    fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<PitchObservation>> {
        let Some(estimate) = detect_pitch_yin(samples, sample_rate, self.amplitude_threshold) else {
            return Ok(Vec::new());
        };
        let magnitudes = self.spectrum.magnitudes(samples);
        let frequency = refine_from_spectrum(&magnitudes, estimate.frequency, sample_rate)
            .unwrap_or(estimate.frequency);
        Ok(vec![PitchObservation {
            frequency,
            confidence: estimate.confidence,
            offset_secs: 0.0,
        }])
    }
}

/// Sweeps YIN over about a second of audio in fixed hops, keeping only the
/// confident frames.
pub struct BatchedEstimator {
    batch_seconds: f32,
    step_ms: u32,
    confidence_threshold: f32,
    amplitude_threshold: f32,
}

impl BatchedEstimator {
    /// Analysis frame length, in seconds.
    const FRAME_SECONDS: f32 = 0.064;

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            batch_seconds: config.batch_seconds,
            step_ms: config.batch_step_ms.max(1),
            confidence_threshold: config.confidence_threshold,
            amplitude_threshold: config.amplitude_threshold,
        }
    }

    fn frame_len(sample_rate: u32) -> usize {
        ((sample_rate as f32 * Self::FRAME_SECONDS) as usize).max(64)
    }
}

impl PitchEstimator for BatchedEstimator {
    fn name(&self) -> &'static str {
        "batched"
    }

    fn block_len(&self, sample_rate: u32) -> usize {
        ((sample_rate as f32 * self.batch_seconds) as usize).max(Self::frame_len(sample_rate))
    }

    fn preferred_sample_rate(&self) -> Option<u32> {
        Some(16_000)
    }

    fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<PitchObservation>> {
        let frame_len = Self::frame_len(sample_rate);
        let hop = ((sample_rate as u64 * self.step_ms as u64 / 1000) as usize).max(1);

        let mut observations = Vec::new();
        let mut start = 0;
        while start + frame_len <= samples.len() {
            let frame = &samples[start..start + frame_len];
            if let Some(estimate) = detect_pitch_yin(frame, sample_rate, self.amplitude_threshold) {
                if estimate.confidence >= self.confidence_threshold {
                    observations.push(PitchObservation {
                        frequency: estimate.frequency,
                        confidence: estimate.confidence,
                        offset_secs: start as f32 / sample_rate as f32,
                    });
                }
            }
            start += hop;
        }
        Ok(observations)
    }
}
