//! # Detector Configuration
//!
//! Every tunable of the detection pipeline lives in [`DetectorConfig`].
//! Configurations round-trip through pretty-printed JSON so a host can
//! persist the user's device and estimator choice between sessions.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::{DetectorError, Result};

/// Which audio device a capture backend should open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// The system default device for the chosen mode.
    #[default]
    Default,
    /// Position in the enumeration returned by the device listing.
    Index(usize),
    /// Exact device name as reported by the host.
    Name(String),
}

impl DeviceSelector {
    /// Parses a command-line style selector: `default`, a number, or a name.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() || text.eq_ignore_ascii_case("default") {
            DeviceSelector::Default
        } else if let Ok(index) = text.parse::<usize>() {
            DeviceSelector::Index(index)
        } else {
            DeviceSelector::Name(text.to_string())
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Default => f.write_str("default"),
            DeviceSelector::Index(i) => write!(f, "#{i}"),
            DeviceSelector::Name(name) => f.write_str(name),
        }
    }
}

/// Where audio comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    /// A microphone-style input device, push-driven by the audio host.
    #[default]
    Input,
    /// The system output mix, pulled by a polling thread.
    Loopback,
}

/// Pitch estimation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorKind {
    /// Accumulate about a second of audio, then estimate many frames at once.
    #[default]
    Batched,
    /// Estimate once per block for the lowest latency.
    LowLatency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub device: DeviceSelector,
    pub mode: CaptureMode,
    pub estimator: EstimatorKind,
    /// Rate requested from Direct Input devices; the device default is used
    /// when the rate is not supported.
    pub target_sample_rate: u32,
    /// Samples per loopback read and per low-latency estimate.
    pub block_size: usize,
    pub batch_seconds: f32,
    pub batch_step_ms: u32,
    pub confidence_threshold: f32,
    pub amplitude_threshold: f32,
    pub analysis_window_seconds: f32,
    pub min_evidence: usize,
    pub max_history: usize,
    pub queue_capacity: usize,
    pub pop_timeout_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Default,
            mode: CaptureMode::Input,
            estimator: EstimatorKind::Batched,
            target_sample_rate: 16_000,
            block_size: 1024,
            batch_seconds: 1.0,
            batch_step_ms: 100,
            confidence_threshold: 0.5,
            amplitude_threshold: 0.01,
            analysis_window_seconds: 5.0,
            min_evidence: 20,
            max_history: 2048,
            queue_capacity: 64,
            pop_timeout_ms: 100,
            join_timeout_ms: 2000,
        }
    }
}

impl DetectorConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Checks the values a running pipeline depends on.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(DetectorError::InvalidConfig(msg.to_string()));
        if self.target_sample_rate == 0 {
            return fail("target_sample_rate must be positive");
        }
        if self.block_size == 0 {
            return fail("block_size must be positive");
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be positive");
        }
        if self.batch_seconds.is_nan() || self.batch_seconds <= 0.0 || self.batch_step_ms == 0 {
            return fail("batch_seconds and batch_step_ms must be positive");
        }
        if self.analysis_window_seconds.is_nan() || self.analysis_window_seconds <= 0.0 {
            return fail("analysis_window_seconds must be positive");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail("confidence_threshold must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.amplitude_threshold) {
            return fail("amplitude_threshold must lie in [0, 1]");
        }
        if self.min_evidence == 0 || self.min_evidence > self.max_history {
            return fail("min_evidence must be positive and not exceed max_history");
        }
        Ok(())
    }
}

/// Saves a detector configuration as pretty JSON.
pub fn save_config(config: &DetectorConfig, path: impl AsRef<Path>) -> Result<()> {
    let json_string = serde_json::to_string_pretty(config)?;
    let mut file = File::create(path)?;
    file.write_all(json_string.as_bytes())?;
    Ok(())
}

/// Loads and validates a detector configuration. Missing fields take
/// their defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<DetectorConfig> {
    let mut file = File::open(path)?;
    let mut data = String::new();
    file.read_to_string(&mut data)?;
    let config: DetectorConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_evidence, 20);
        assert_eq!(config.join_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DetectorConfig =
            serde_json::from_str(r#"{ "mode": "Loopback", "device": { "Index": 3 } }"#).unwrap();
        assert_eq!(config.mode, CaptureMode::Loopback);
        assert_eq!(config.device, DeviceSelector::Index(3));
        assert_eq!(config.block_size, 1024);
    }

    #[test]
    fn rejects_broken_values() {
        let config = DetectorConfig {
            confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DetectorError::InvalidConfig(_))));

        let config = DetectorConfig {
            min_evidence: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        for broken in [f32::NAN, 0.0, -1.0] {
            let config = DetectorConfig {
                batch_seconds: broken,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "batch_seconds {broken} accepted");
            let config = DetectorConfig {
                analysis_window_seconds: broken,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "window {broken} accepted");
        }
    }

    #[test]
    fn save_then_load_keeps_selection() {
        let path = std::env::temp_dir().join(format!("autokey-config-{}.json", std::process::id()));
        let config = DetectorConfig {
            device: DeviceSelector::Name("Stereo Mix".into()),
            estimator: EstimatorKind::LowLatency,
            ..Default::default()
        };
        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(DeviceSelector::parse("default"), DeviceSelector::Default);
        assert_eq!(DeviceSelector::parse(" 2 "), DeviceSelector::Index(2));
        assert_eq!(
            DeviceSelector::parse("USB Mic"),
            DeviceSelector::Name("USB Mic".into())
        );
    }
}
