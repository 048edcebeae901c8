//! Short input-level check for a capture device.
//!
//! Opens a device through any [`CaptureBackend`], measures the RMS of each
//! frame for a fixed time and grades the loudest one. Used to confirm a
//! microphone or loopback source is live before running detection.

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use super::{CaptureBackend, CaptureFaults, CaptureRequest};
use crate::error::{DetectorError, Result};
use crate::pitch::rms;
use crate::queue::{FrameQueue, Pop};

/// Peak RMS under this is treated as no signal at all.
pub const SILENT_PEAK: f32 = 0.01;
/// Peak RMS under this is audible but likely too quiet for detection.
pub const LOW_PEAK: f32 = 0.05;

/// Width of the level bar at full scale.
const BAR_WIDTH: usize = 50;
const QUEUE_CAPACITY: usize = 64;
const POP_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelVerdict {
    Silent,
    Low,
    Good,
}

impl LevelVerdict {
    pub fn from_peak(peak: f32) -> Self {
        if peak.is_nan() || peak < SILENT_PEAK {
            LevelVerdict::Silent
        } else if peak < LOW_PEAK {
            LevelVerdict::Low
        } else {
            LevelVerdict::Good
        }
    }
}

/// Levels seen over one check.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelReport {
    pub frames: usize,
    pub average: f32,
    pub peak: f32,
    pub sample_rate: u32,
}

impl LevelReport {
    pub fn verdict(&self) -> LevelVerdict {
        LevelVerdict::from_peak(self.peak)
    }
}

/// Bar of `█` proportional to `level`, 100 cells per unit RMS, capped at
/// [`BAR_WIDTH`].
pub fn level_bar(level: f32) -> String {
    let cells = if level.is_finite() && level > 0.0 {
        ((level * 100.0) as usize).min(BAR_WIDTH)
    } else {
        0
    };
    "█".repeat(cells)
}

/// Captures from `request` for `duration`, calling `on_frame` with each
/// frame's RMS as it arrives.
///
/// A capture fault ends the check early with [`DetectorError::CaptureFailed`].
pub fn measure_level<F>(
    backend: &dyn CaptureBackend,
    request: &CaptureRequest,
    duration: Duration,
    mut on_frame: F,
) -> Result<LevelReport>
where
    F: FnMut(f32),
{
    let queue = FrameQueue::bounded(QUEUE_CAPACITY);
    let faults = CaptureFaults::new();
    let capture = backend.start(request, queue.clone(), faults.clone())?;
    info!("Measuring level of {} for {duration:?}", capture.description());

    let mut report = LevelReport {
        sample_rate: capture.sample_rate(),
        ..Default::default()
    };
    let mut total = 0.0f32;
    let deadline = Instant::now() + duration;
    let mut failure = None;

    while Instant::now() < deadline {
        if let Some(message) = faults.message() {
            failure = Some(DetectorError::CaptureFailed(message.to_string()));
            break;
        }
        let frame = match queue.pop(POP_TIMEOUT) {
            Pop::Frame(frame) => frame,
            Pop::Empty => continue,
            Pop::Closed => break,
        };
        if frame.samples.is_empty() {
            continue;
        }
        let level = rms(&frame.samples);
        report.frames += 1;
        report.peak = report.peak.max(level);
        total += level;
        on_frame(level);
    }

    if !capture.stop(Duration::from_secs(2)) {
        warn!("Capture thread did not stop after the level check");
    }
    if let Some(failure) = failure {
        return Err(failure);
    }
    if report.frames > 0 {
        report.average = total / report.frames as f32;
    }
    debug!("Level check: {report:?}, {} overruns", queue.overruns());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{spawn_capture_thread, CaptureHandle};
    use crate::config::{CaptureMode, DeviceSelector};
    use crate::queue::AudioFrame;
    use approx::assert_abs_diff_eq;

    /// Pushes square-wave frames of a fixed amplitude until stopped.
    struct SteadyTone {
        amplitude: f32,
        fault_after: Option<usize>,
    }

    impl CaptureBackend for SteadyTone {
        fn name(&self) -> &'static str {
            "steady"
        }

        fn start(
            &self,
            _request: &CaptureRequest,
            queue: FrameQueue,
            faults: CaptureFaults,
        ) -> Result<CaptureHandle> {
            let amplitude = self.amplitude;
            let fault_after = self.fault_after;
            spawn_capture_thread("steady", "steady tone".into(), move |stop, ready| {
                let _ = ready.send(Ok(16_000));
                let mut sent = 0;
                while !stop.is_raised() {
                    if fault_after == Some(sent) {
                        faults.raise("device unplugged");
                        break;
                    }
                    let samples = (0..256)
                        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
                        .collect();
                    queue.push(AudioFrame::new(samples, 16_000));
                    sent += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            device: DeviceSelector::Default,
            mode: CaptureMode::Input,
            sample_rate: 16_000,
            block_size: 256,
        }
    }

    #[test]
    fn verdict_thresholds() {
        assert_eq!(LevelVerdict::from_peak(0.0), LevelVerdict::Silent);
        assert_eq!(LevelVerdict::from_peak(0.009), LevelVerdict::Silent);
        assert_eq!(LevelVerdict::from_peak(0.02), LevelVerdict::Low);
        assert_eq!(LevelVerdict::from_peak(0.05), LevelVerdict::Good);
        assert_eq!(LevelVerdict::from_peak(f32::NAN), LevelVerdict::Silent);
    }

    #[test]
    fn bar_scales_and_caps() {
        assert_eq!(level_bar(0.0), "");
        assert_eq!(level_bar(0.1).chars().count(), 10);
        assert_eq!(level_bar(3.0).chars().count(), BAR_WIDTH);
        assert_eq!(level_bar(f32::NAN), "");
    }

    #[test]
    fn measures_a_live_source() {
        let backend = SteadyTone { amplitude: 0.25, fault_after: None };
        let mut seen = 0;
        let report =
            measure_level(&backend, &request(), Duration::from_millis(200), |_| seen += 1).unwrap();
        assert!(report.frames > 0);
        assert_eq!(report.frames, seen);
        assert_eq!(report.sample_rate, 16_000);
        assert_abs_diff_eq!(report.peak, 0.25, epsilon = 1e-5);
        assert_abs_diff_eq!(report.average, 0.25, epsilon = 1e-5);
        assert_eq!(report.verdict(), LevelVerdict::Good);
    }

    #[test]
    fn quiet_source_is_flagged() {
        let backend = SteadyTone { amplitude: 0.001, fault_after: None };
        let report = measure_level(&backend, &request(), Duration::from_millis(100), |_| {}).unwrap();
        assert_eq!(report.verdict(), LevelVerdict::Silent);
    }

    #[test]
    fn fault_ends_the_check() {
        let backend = SteadyTone { amplitude: 0.25, fault_after: Some(2) };
        let result = measure_level(&backend, &request(), Duration::from_secs(5), |_| {});
        assert!(matches!(result, Err(DetectorError::CaptureFailed(_))));
    }
}
