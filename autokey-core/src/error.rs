//! Error types for the key/scale detection engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("No audio device available")]
    NoDevice,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(#[from] cpal::BuildStreamError),

    #[error("Failed to start audio stream: {0}")]
    StreamPlay(#[from] cpal::PlayStreamError),

    #[error("Failed to enumerate audio devices: {0}")]
    DeviceEnumeration(String),

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Pitch estimation failed: {0}")]
    Estimator(String),

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("MIDI output error: {0}")]
    Midi(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Config serialization error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for DetectorError {
    fn from(e: cpal::DevicesError) -> Self {
        DetectorError::DeviceEnumeration(e.to_string())
    }
}

impl From<cpal::DeviceNameError> for DetectorError {
    fn from(e: cpal::DeviceNameError) -> Self {
        DetectorError::DeviceEnumeration(e.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for DetectorError {
    fn from(e: cpal::SupportedStreamConfigsError) -> Self {
        DetectorError::UnsupportedFormat(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for DetectorError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        DetectorError::UnsupportedFormat(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;
