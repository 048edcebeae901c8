//! # Audio Capture Module
//!
//! Capture backends own an audio device and turn whatever it delivers into
//! mono [`AudioFrame`]s on a [`FrameQueue`]. Two shapes exist behind the one
//! [`CaptureBackend`] trait:
//!
//! - **Input**: the audio host pushes blocks into a callback on its own
//!   thread (see [`input`]).
//! - **Loopback**: a polling thread pulls fixed-size blocks from a recorder
//!   bound to the system output (see [`loopback`]).
//!
//! Either way the device object stays on the thread that opened it, the
//! open result is reported back before `start` returns, and the run is torn
//! down through a [`CaptureHandle`].

pub mod devices;
pub mod input;
pub mod level;
pub mod loopback;

use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;
use std::time::Duration;

use crate::config::{CaptureMode, DetectorConfig, DeviceSelector};
use crate::error::{DetectorError, Result};
use crate::queue::FrameQueue;
use crate::worker::WorkerThread;

pub use devices::{list_input_devices, list_output_devices, DeviceInfo};
pub use level::{level_bar, measure_level, LevelReport, LevelVerdict};
pub use loopback::{RecordedBlock, Recorder};

/// How long `start` waits for a capture thread to report that its device
/// is open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a detector run asks of its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub device: DeviceSelector,
    pub mode: CaptureMode,
    /// Rate the estimator works best at. Input devices are opened at this
    /// rate when they support it; frames always carry their actual rate.
    pub sample_rate: u32,
    /// Frames per loopback read.
    pub block_size: usize,
}

impl CaptureRequest {
    pub fn from_config(config: &DetectorConfig, sample_rate: u32) -> Self {
        Self {
            device: config.device.clone(),
            mode: config.mode,
            sample_rate,
            block_size: config.block_size,
        }
    }
}

/// Cooperative stop flag shared by a capture thread and its handle.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// First capture fault of a run: device lost, read failure, and so on.
///
/// Raised from audio callbacks or capture threads and polled by the
/// analysis thread. Only the first message is kept.
#[derive(Debug, Clone, Default)]
pub struct CaptureFaults(Arc<OnceLock<String>>);

impl CaptureFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        if self.0.set(message.clone()).is_ok() {
            error!("Capture fault: {message}");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.0.get().is_some()
    }

    pub fn message(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }
}

/// Asks a capture thread to wind down without waiting for it. Held by the
/// analysis thread so a faulted run can release its device on its own.
#[derive(Debug, Clone)]
pub struct CaptureStopper {
    stop: StopSignal,
    thread: Option<Thread>,
}

impl CaptureStopper {
    pub fn request(&self) {
        self.stop.raise();
        if let Some(thread) = &self.thread {
            thread.unpark();
        }
    }
}

/// A live capture. Dropping it without calling [`CaptureHandle::stop`]
/// still raises the stop flag, but does not wait for the thread.
#[derive(Debug)]
pub struct CaptureHandle {
    stop: StopSignal,
    worker: Option<WorkerThread>,
    sample_rate: u32,
    description: String,
}

impl CaptureHandle {
    pub fn new(stop: StopSignal, worker: WorkerThread, sample_rate: u32, description: String) -> Self {
        Self {
            stop,
            worker: Some(worker),
            sample_rate,
            description,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn stopper(&self) -> CaptureStopper {
        CaptureStopper {
            stop: self.stop.clone(),
            thread: self.worker.as_ref().and_then(WorkerThread::thread),
        }
    }

    /// Signals the capture thread and waits up to `timeout` for it.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.stop.raise();
        match self.worker.take() {
            Some(worker) => {
                worker.unpark();
                worker.join_within(timeout)
            }
            None => true,
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.raise();
        if let Some(worker) = &self.worker {
            worker.unpark();
        }
    }
}

/// A source of mono audio frames.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens the requested device and starts pushing frames onto `queue`.
    ///
    /// Must not return `Ok` until the device is actually open; open
    /// failures come back as `Err` with nothing left running.
    fn start(
        &self,
        request: &CaptureRequest,
        queue: FrameQueue,
        faults: CaptureFaults,
    ) -> Result<CaptureHandle>;
}

/// Production backend on top of cpal, covering both capture modes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

impl CaptureBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn start(
        &self,
        request: &CaptureRequest,
        queue: FrameQueue,
        faults: CaptureFaults,
    ) -> Result<CaptureHandle> {
        match request.mode {
            CaptureMode::Input => input::spawn_input(request, queue, faults),
            CaptureMode::Loopback => {
                let device = request.device.clone();
                let recorder_queue = queue.clone();
                let recorder_faults = faults.clone();
                loopback::spawn_loopback(
                    move || loopback::CpalRecorder::open(&device, recorder_queue, recorder_faults),
                    request.block_size,
                    queue,
                    faults,
                )
            }
        }
    }
}

/// Runs `body` on a named capture thread and waits for it to report its
/// sample rate (device open) or an open error.
pub(crate) fn spawn_capture_thread<F>(
    name: &str,
    description: String,
    body: F,
) -> Result<CaptureHandle>
where
    F: FnOnce(StopSignal, Sender<Result<u32>>) + Send + 'static,
{
    let stop = StopSignal::new();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
    let thread_stop = stop.clone();
    let worker = WorkerThread::spawn(name, move || body(thread_stop, ready_tx))?;

    match ready_rx.recv_timeout(OPEN_TIMEOUT) {
        Ok(Ok(sample_rate)) => {
            info!("Capture started: {description} at {sample_rate} Hz");
            Ok(CaptureHandle::new(stop, worker, sample_rate, description))
        }
        Ok(Err(e)) => {
            stop.raise();
            worker.join_within(OPEN_TIMEOUT);
            Err(e)
        }
        Err(RecvTimeoutError::Timeout) => {
            stop.raise();
            worker.unpark();
            worker.join_within(Duration::from_millis(100));
            Err(DetectorError::CaptureFailed(format!(
                "{description}: device did not open within {OPEN_TIMEOUT:?}"
            )))
        }
        Err(RecvTimeoutError::Disconnected) => {
            worker.join_within(OPEN_TIMEOUT);
            Err(DetectorError::CaptureFailed(format!(
                "{description}: capture thread exited before opening the device"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fault_wins() {
        let faults = CaptureFaults::new();
        assert!(!faults.is_raised());
        faults.raise("device unplugged");
        faults.raise("second problem");
        assert_eq!(faults.message(), Some("device unplugged"));
    }

    #[test]
    fn open_error_is_returned_and_thread_reaped() {
        let result = spawn_capture_thread("fails", "test device".into(), |_stop, ready| {
            let _ = ready.send(Err(DetectorError::NoDevice));
        });
        assert!(matches!(result, Err(DetectorError::NoDevice)));
    }

    #[test]
    fn thread_that_never_reports_is_an_error() {
        let result = spawn_capture_thread("silent", "test device".into(), |_stop, _ready| {});
        assert!(matches!(result, Err(DetectorError::CaptureFailed(_))));
    }

    #[test]
    fn stop_wakes_a_parked_capture_thread() {
        let handle = spawn_capture_thread("parked", "test device".into(), |stop, ready| {
            let _ = ready.send(Ok(16_000));
            while !stop.is_raised() {
                std::thread::park_timeout(Duration::from_secs(10));
            }
        })
        .unwrap();
        assert_eq!(handle.sample_rate(), 16_000);
        assert!(handle.stop(Duration::from_secs(2)));
    }

    #[test]
    fn stopper_releases_the_thread_without_the_handle() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let handle = spawn_capture_thread("stopped-remotely", "test device".into(), move |stop, ready| {
            let _ = ready.send(Ok(16_000));
            while !stop.is_raised() {
                std::thread::park_timeout(Duration::from_secs(10));
            }
            flag.store(true, Ordering::Release);
        })
        .unwrap();
        let stopper = handle.stopper();
        std::thread::spawn(move || stopper.request()).join().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !exited.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(exited.load(Ordering::Acquire));
        // Already exited, so the join is immediate.
        assert!(handle.stop(Duration::from_millis(500)));
    }
}
