// autokey-core/src/lib.rs

//! The core logic for realtime key detection.
//! This crate captures audio from an input device or the system output,
//! estimates pitches, and infers the musical key and scale being played.
//! It is completely headless; the `autokey` binary wires it to a terminal
//! and a MIDI port.

pub mod capture;
pub mod config;
pub mod detector;
pub mod error;
pub mod estimator;
pub mod fft;
pub mod history;
pub mod midi;
pub mod notes;
pub mod pitch;
pub mod queue;
pub mod tracker;
pub mod worker;

pub use capture::{CaptureBackend, CaptureFaults, CaptureHandle, CaptureRequest, CpalBackend, StopSignal};
pub use config::{CaptureMode, DetectorConfig, DeviceSelector, EstimatorKind};
pub use detector::{DetectorState, KeyDetector};
pub use error::{DetectorError, Result};
pub use estimator::{PitchEstimator, PitchObservation};
pub use history::{classify, KeyScale, PitchHistory, Scale};
pub use notes::PitchClass;
pub use queue::{AudioFrame, FrameQueue};
