//! # Key Detector
//!
//! Lifecycle controller for the detection pipeline:
//!
//! ```text
//! capture backend ──► FrameQueue ──► analysis thread
//!                                    (estimator → history → classifier → change gate)
//!                                                                          │
//!                                                              on_change callback
//! ```
//!
//! `start` allocates a fresh queue, opens the backend and spawns the analysis
//! thread; `stop` signals both, joins each within the configured timeout and
//! drops everything the run owned. Nothing from one run survives into the
//! next, including the last emitted key.

use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{
    CaptureBackend, CaptureFaults, CaptureHandle, CaptureRequest, CaptureStopper, CpalBackend,
};
use crate::config::{CaptureMode, DetectorConfig, DeviceSelector};
use crate::error::{DetectorError, Result};
use crate::estimator::{factory_for, EstimatorFactory, PitchEstimator};
use crate::history::KeyScale;
use crate::queue::{FrameQueue, Pop};
use crate::tracker::KeyTracker;
use crate::worker::WorkerThread;

/// Receives each changed key. Called on the analysis thread.
pub type KeyCallback = Arc<dyn Fn(&KeyScale) + Send + Sync>;

/// Receives failures that end a run on their own, such as a lost device.
pub type ErrorCallback = Arc<dyn Fn(&DetectorError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Running,
}

/// Everything one run owns.
struct ActiveRun {
    running: Arc<AtomicBool>,
    capture: CaptureHandle,
    analysis: WorkerThread,
    queue: FrameQueue,
}

pub struct KeyDetector {
    config: DetectorConfig,
    backend: Arc<dyn CaptureBackend>,
    estimator_factory: EstimatorFactory,
    on_change: KeyCallback,
    on_error: Option<ErrorCallback>,
    run: Option<ActiveRun>,
}

impl KeyDetector {
    /// A detector on the cpal backend with the estimator named in `config`.
    pub fn new<F>(config: DetectorConfig, on_change: F) -> Self
    where
        F: Fn(&KeyScale) + Send + Sync + 'static,
    {
        let estimator_factory = factory_for(&config);
        Self {
            config,
            backend: Arc::new(CpalBackend),
            estimator_factory,
            on_change: Arc::new(on_change),
            on_error: None,
            run: None,
        }
    }

    pub fn with_backend<B>(mut self, backend: B) -> Self
    where
        B: CaptureBackend + 'static,
    {
        self.backend = Arc::new(backend);
        self
    }

    pub fn with_estimator<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn PitchEstimator> + Send + Sync + 'static,
    {
        self.estimator_factory = Arc::new(factory);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DetectorError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> DetectorState {
        if self.is_running() {
            DetectorState::Running
        } else {
            DetectorState::Idle
        }
    }

    /// False once a run has been stopped or has ended itself after a
    /// capture fault.
    pub fn is_running(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| run.running.load(Ordering::Acquire))
    }

    /// Frames the current run has dropped to queue overruns.
    pub fn dropped_frames(&self) -> u64 {
        self.run.as_ref().map_or(0, |run| run.queue.overruns())
    }

    /// Starts capture and analysis. A no-op when already running.
    ///
    /// On error nothing is left running and the detector stays idle.
    pub fn start(&mut self) -> Result<()> {
        if let Some(run) = &self.run {
            if run.running.load(Ordering::Acquire) {
                warn!("Key detector already running; start ignored");
                return Ok(());
            }
            debug!("Reclaiming a run that ended on its own");
            self.teardown();
        }

        self.config.validate()?;
        let estimator = (self.estimator_factory)();
        let sample_rate = estimator
            .preferred_sample_rate()
            .unwrap_or(self.config.target_sample_rate);
        let request = CaptureRequest::from_config(&self.config, sample_rate);
        info!(
            "Starting key detection: {:?} capture from {}, {} estimator, {} backend",
            request.mode,
            request.device,
            estimator.name(),
            self.backend.name()
        );

        let queue = FrameQueue::bounded(self.config.queue_capacity);
        let faults = CaptureFaults::new();
        let capture = match self.backend.start(&request, queue.clone(), faults.clone()) {
            Ok(capture) => capture,
            Err(e) => {
                error!("Failed to start audio capture: {e}");
                return Err(e);
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let analysis = AnalysisLoop {
            queue: queue.clone(),
            running: running.clone(),
            faults,
            capture: capture.stopper(),
            estimator,
            tracker: KeyTracker::new(&self.config),
            on_change: self.on_change.clone(),
            on_error: self.on_error.clone(),
            pop_timeout: self.config.pop_timeout(),
        };
        let analysis = match WorkerThread::spawn("autokey-analysis", move || analysis.run()) {
            Ok(worker) => worker,
            Err(e) => {
                error!("Failed to spawn analysis thread: {e}");
                capture.stop(self.config.join_timeout());
                return Err(e);
            }
        };

        self.run = Some(ActiveRun {
            running,
            capture,
            analysis,
            queue,
        });
        info!("Key detection started");
        Ok(())
    }

    /// Stops capture and analysis. A no-op when idle.
    pub fn stop(&mut self) {
        if self.run.is_none() {
            return;
        }
        info!("Stopping key detection...");
        self.teardown();
        info!("Key detection stopped");
    }

    /// Switches device or mode: stop, reconfigure, start.
    pub fn restart_with(&mut self, device: DeviceSelector, mode: CaptureMode) -> Result<()> {
        self.stop();
        self.config.device = device;
        self.config.mode = mode;
        self.start()
    }

    fn teardown(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.running.store(false, Ordering::Release);
        debug!("Tearing down capture from {}", run.capture.description());
        let timeout = self.config.join_timeout();
        let capture_stopped = run.capture.stop(timeout);
        let analysis_stopped = run.analysis.join_within(timeout);
        if !(capture_stopped && analysis_stopped) {
            error!("Key detector did not stop cleanly; its resources were released anyway");
        }
        let dropped = run.queue.overruns();
        if dropped > 0 {
            info!("Run dropped {dropped} frames to queue overruns");
        }
    }
}

impl Drop for KeyDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved onto the analysis thread for one run.
struct AnalysisLoop {
    queue: FrameQueue,
    running: Arc<AtomicBool>,
    faults: CaptureFaults,
    capture: CaptureStopper,
    estimator: Box<dyn PitchEstimator>,
    tracker: KeyTracker,
    on_change: KeyCallback,
    on_error: Option<ErrorCallback>,
    pop_timeout: Duration,
}

impl AnalysisLoop {
    fn run(mut self) {
        debug!("Analysis thread running");
        let mut accumulated: Vec<f32> = Vec::new();
        let mut sample_rate = 0u32;

        while self.running.load(Ordering::Acquire) {
            if let Some(message) = self.faults.message() {
                let failure = DetectorError::CaptureFailed(message.to_string());
                error!("Stopping key detection: {failure}");
                self.running.store(false, Ordering::Release);
                // Release the device now rather than at the next stop/start.
                self.capture.request();
                if let Some(on_error) = &self.on_error {
                    on_error(&failure);
                }
                break;
            }

            let frame = match self.queue.pop(self.pop_timeout) {
                Pop::Frame(frame) => frame,
                Pop::Empty => continue,
                Pop::Closed => break,
            };
            if frame.sample_rate == 0 {
                continue;
            }
            if frame.sample_rate != sample_rate {
                if sample_rate != 0 {
                    warn!(
                        "Sample rate changed from {sample_rate} to {} Hz; discarding partial block",
                        frame.sample_rate
                    );
                }
                accumulated.clear();
                sample_rate = frame.sample_rate;
            }
            accumulated.extend_from_slice(&frame.samples);

            let block_len = self.estimator.block_len(sample_rate).max(1);
            while accumulated.len() >= block_len {
                let block: Vec<f32> = accumulated.drain(..block_len).collect();
                self.run_cycle(&block, sample_rate);
            }
        }
        debug!("Analysis thread exiting");
    }

    fn run_cycle(&mut self, block: &[f32], sample_rate: u32) {
        let estimator = &mut self.estimator;
        let observations =
            match panic::catch_unwind(AssertUnwindSafe(|| estimator.estimate(block, sample_rate))) {
                Ok(Ok(observations)) => observations,
                Ok(Err(e)) => {
                    warn!("Pitch estimation failed, skipping cycle: {e}");
                    return;
                }
                Err(_) => {
                    error!("Pitch estimator panicked, skipping cycle");
                    return;
                }
            };

        let cycle_seconds = block.len() as f32 / sample_rate as f32;
        if let Some(key) = self.tracker.process_cycle(&observations, cycle_seconds) {
            info!("Detected key: {key}");
            let on_change = &self.on_change;
            if panic::catch_unwind(AssertUnwindSafe(|| on_change(&key))).is_err() {
                error!("Key callback panicked");
            }
        }
    }
}
