//! # Loopback Capture
//!
//! Records the system output mix. A polling thread repeatedly asks a
//! [`Recorder`] for a fixed number of frames, downmixes them to mono,
//! rescales integer samples, and enqueues the result. The stop flag is
//! checked before every read and each read waits at most about two block
//! durations, which bounds shutdown latency.
//!
//! The cpal recorder builds an input stream on an *output* device, which
//! the WASAPI host serves as a loopback capture. Hosts without loopback
//! support fail at open time and the error reaches `start`.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{info, warn};
use std::time::{Duration, Instant};

use super::{devices, spawn_capture_thread, CaptureFaults, CaptureHandle, StopSignal};
use crate::config::DeviceSelector;
use crate::error::{DetectorError, Result};
use crate::queue::{AudioFrame, FrameQueue};

/// Scale factor from 16-bit PCM to `[-1.0, 1.0)`.
const I16_SCALE: f32 = 1.0 / 32768.0;

/// Interleaved samples as the recorder delivered them.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedBlock {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl RecordedBlock {
    /// Total interleaved samples.
    pub fn len(&self) -> usize {
        match self {
            RecordedBlock::F32(s) => s.len(),
            RecordedBlock::I16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Averages channels and maps integer samples to the float range.
    pub fn to_mono(&self, channels: u16) -> Vec<f32> {
        let channels = channels.max(1) as usize;
        match self {
            RecordedBlock::F32(samples) => samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect(),
            RecordedBlock::I16(samples) => samples
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame.iter().map(|&s| s as f32).sum();
                    sum / frame.len() as f32 * I16_SCALE
                })
                .collect(),
        }
    }

    fn empty_like(&self) -> Self {
        match self {
            RecordedBlock::F32(_) => RecordedBlock::F32(Vec::new()),
            RecordedBlock::I16(_) => RecordedBlock::I16(Vec::new()),
        }
    }

    fn into_floats(self) -> Vec<f32> {
        match self {
            RecordedBlock::F32(samples) => samples,
            RecordedBlock::I16(samples) => samples.into_iter().map(|s| s as f32 * I16_SCALE).collect(),
        }
    }

    /// Appends `other`; a format mismatch promotes the whole block to float.
    fn append(&mut self, other: RecordedBlock) {
        match (self, other) {
            (RecordedBlock::I16(a), RecordedBlock::I16(b)) => a.extend(b),
            (RecordedBlock::F32(a), other) => a.extend(other.into_floats()),
            (this, other) => {
                let mut floats = std::mem::replace(this, RecordedBlock::F32(Vec::new())).into_floats();
                floats.extend(other.into_floats());
                *this = RecordedBlock::F32(floats);
            }
        }
    }

    /// Removes and returns the first `n` samples.
    fn take_front(&mut self, n: usize) -> RecordedBlock {
        match self {
            RecordedBlock::F32(s) => RecordedBlock::F32(s.drain(..n.min(s.len())).collect()),
            RecordedBlock::I16(s) => RecordedBlock::I16(s.drain(..n.min(s.len())).collect()),
        }
    }
}

/// A pull-style recorder bound to the system output.
pub trait Recorder {
    fn channels(&self) -> u16;

    fn sample_rate(&self) -> u32;

    /// Returns up to `frames` frames of interleaved audio, waiting at most
    /// `timeout`. A short or empty block means nothing more arrived in time.
    fn record(&mut self, frames: usize, timeout: Duration) -> Result<RecordedBlock>;
}

/// Pulls blocks until `stop` is raised or the recorder fails.
pub fn run_polling_loop<R: Recorder>(
    recorder: &mut R,
    block_frames: usize,
    queue: &FrameQueue,
    stop: &StopSignal,
    faults: &CaptureFaults,
) {
    let channels = recorder.channels();
    let sample_rate = recorder.sample_rate();
    let block_frames = block_frames.max(1);
    let block_duration = Duration::from_secs_f64(block_frames as f64 / sample_rate.max(1) as f64);
    let read_timeout = block_duration * 2;

    while !stop.is_raised() {
        if faults.is_raised() {
            break;
        }
        match recorder.record(block_frames, read_timeout) {
            Ok(block) => {
                if block.is_empty() {
                    continue;
                }
                queue.push(AudioFrame::new(block.to_mono(channels), sample_rate));
            }
            Err(e) => {
                faults.raise(format!("loopback read failed: {e}"));
                break;
            }
        }
    }
}

/// Opens a recorder on a polling thread and runs [`run_polling_loop`].
///
/// `open` runs on the polling thread, so the recorder never crosses
/// threads; its result is reported back before this returns.
pub fn spawn_loopback<R, F>(
    open: F,
    block_frames: usize,
    queue: FrameQueue,
    faults: CaptureFaults,
) -> Result<CaptureHandle>
where
    R: Recorder,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    spawn_capture_thread("autokey-loopback", "loopback recorder".into(), move |stop, ready| {
        let mut recorder = match open() {
            Ok(recorder) => recorder,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(recorder.sample_rate()));
        run_polling_loop(&mut recorder, block_frames, &queue, &stop, &faults);
        info!("Loopback capture stopped");
    })
}

/// Loopback recorder over a cpal input stream opened on an output device.
pub struct CpalRecorder {
    _stream: cpal::Stream,
    rx: Receiver<RecordedBlock>,
    pending: RecordedBlock,
    channels: u16,
    sample_rate: u32,
    faults: CaptureFaults,
}

impl CpalRecorder {
    /// Blocks the callback cannot hand off are counted as overruns on
    /// `queue`.
    pub fn open(selector: &DeviceSelector, queue: FrameQueue, faults: CaptureFaults) -> Result<Self> {
        let device = devices::find_output_device(selector)?;
        info!(
            "Loopback from output device: {}",
            device.name().unwrap_or_else(|_| "<unnamed>".into())
        );

        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let channels = config.channels;
        let sample_rate = config.sample_rate.0;

        // Room for about two seconds of callbacks; a stalled reader loses
        // the newest blocks rather than growing without bound.
        let (tx, rx) = crossbeam_channel::bounded::<RecordedBlock>(256);
        let stream = match sample_format {
            SampleFormat::F32 => build_loopback_stream(&device, &config, tx, &queue, &faults, |d: &[f32]| {
                RecordedBlock::F32(d.to_vec())
            })?,
            SampleFormat::I16 => build_loopback_stream(&device, &config, tx, &queue, &faults, |d: &[i16]| {
                RecordedBlock::I16(d.to_vec())
            })?,
            other => return Err(DetectorError::UnsupportedFormat(format!("{other:?}"))),
        };
        stream.play()?;

        info!("Loopback recording at {sample_rate} Hz, {channels} channel(s), {sample_format:?}");
        let pending = match sample_format {
            SampleFormat::I16 => RecordedBlock::I16(Vec::new()),
            _ => RecordedBlock::F32(Vec::new()),
        };
        Ok(Self {
            _stream: stream,
            rx,
            pending,
            channels,
            sample_rate,
            faults,
        })
    }
}

fn build_loopback_stream<T, C>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: Sender<RecordedBlock>,
    queue: &FrameQueue,
    faults: &CaptureFaults,
    convert: C,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    C: Fn(&[T]) -> RecordedBlock + Send + 'static,
{
    let faults = faults.clone();
    let queue = queue.clone();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| hand_off(&tx, convert(data), &queue),
        move |err| match err {
            cpal::StreamError::DeviceNotAvailable => faults.raise("output device is no longer available"),
            other => warn!("An error occurred on the loopback stream: {other}"),
        },
        None,
    )?;
    Ok(stream)
}

/// Passes one callback block to the polling thread without waiting. A full
/// hand-off channel means the reader is behind; the block is dropped and
/// counted.
fn hand_off(tx: &Sender<RecordedBlock>, block: RecordedBlock, queue: &FrameQueue) {
    match tx.try_send(block) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            queue.record_overrun("loopback hand-off full, dropped newest block");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

impl Recorder for CpalRecorder {
    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn record(&mut self, frames: usize, timeout: Duration) -> Result<RecordedBlock> {
        let wanted = frames * self.channels.max(1) as usize;
        let deadline = Instant::now() + timeout;
        while self.pending.len() < wanted {
            if let Some(message) = self.faults.message() {
                return Err(DetectorError::CaptureFailed(message.to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(block) => self.pending.append(block),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DetectorError::CaptureFailed("loopback stream closed".into()));
                }
            }
        }
        // Whole frames only, so channels never shift.
        let available = self.pending.len().min(wanted);
        let whole = available - available % self.channels.max(1) as usize;
        if whole == 0 {
            return Ok(self.pending.empty_like());
        }
        Ok(self.pending.take_front(whole))
    }
}
