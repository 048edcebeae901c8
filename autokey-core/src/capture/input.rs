//! # Direct Input Capture
//!
//! Opens an input device through cpal and pushes every block the audio host
//! delivers onto the frame queue.
//!
//! ## Audio Configuration
//! - Sample Rate: the requested rate when the device supports it (16 kHz
//!   for the default estimator), else the device default
//! - Format: 32-bit float, 16-bit signed or 16-bit unsigned
//! - Channels: the fewest the device offers, downmixed to mono

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, SupportedStreamConfigRange};
use log::{info, warn};
use std::time::Duration;

use super::{devices, spawn_capture_thread, CaptureFaults, CaptureHandle, CaptureRequest};
use crate::error::{DetectorError, Result};
use crate::queue::{AudioFrame, FrameQueue};

/// How often the owner thread re-checks its stop flag while parked.
const PARK_INTERVAL: Duration = Duration::from_millis(50);

/// Starts Direct Input capture on a dedicated owner thread.
///
/// The cpal stream is created, played and dropped on that thread; the
/// audio callback itself runs on the host's thread and only copies,
/// downmixes and enqueues.
pub(crate) fn spawn_input(
    request: &CaptureRequest,
    queue: FrameQueue,
    faults: CaptureFaults,
) -> Result<CaptureHandle> {
    let selector = request.device.clone();
    let target_rate = request.sample_rate;
    let description = format!("input device {selector}");

    spawn_capture_thread("autokey-input", description, move |stop, ready| {
        let opened = devices::find_input_device(&selector)
            .and_then(|device| open_input_stream(&device, target_rate, queue, faults));
        let (stream, sample_rate) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(e.into()));
            return;
        }
        let _ = ready.send(Ok(sample_rate));

        while !stop.is_raised() {
            std::thread::park_timeout(PARK_INTERVAL);
        }

        if let Err(e) = stream.pause() {
            warn!("Error pausing input stream: {e}");
        }
        drop(stream);
        info!("Input capture stopped");
    })
}

/// Builds (but does not play) a mono-normalizing input stream.
fn open_input_stream(
    device: &cpal::Device,
    target_rate: u32,
    queue: FrameQueue,
    faults: CaptureFaults,
) -> Result<(cpal::Stream, u32)> {
    info!(
        "Using audio input device: {}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );

    let configs = device.supported_input_configs()?.collect::<Vec<_>>();
    let supported_config = match find_supported_config(configs, target_rate) {
        Some(range) => range.with_sample_rate(cpal::SampleRate(target_rate)),
        None => {
            let fallback = device.default_input_config()?;
            warn!(
                "Device cannot record at {target_rate} Hz; using its default {} Hz",
                fallback.sample_rate().0
            );
            fallback
        }
    };

    let sample_format = supported_config.sample_format();
    let config: cpal::StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    info!(
        "Selected {} Hz, {} channel(s), {:?}",
        sample_rate, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_mono_stream::<f32>(device, &config, queue, faults)?,
        SampleFormat::I16 => build_mono_stream::<i16>(device, &config, queue, faults)?,
        SampleFormat::U16 => build_mono_stream::<u16>(device, &config, queue, faults)?,
        other => return Err(DetectorError::UnsupportedFormat(format!("{other:?}"))),
    };
    Ok((stream, sample_rate))
}

fn build_mono_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: FrameQueue,
    faults: CaptureFaults,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;

    let err_fn = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => faults.raise("input device is no longer available"),
        other => warn!("An error occurred on the input stream: {other}"),
    };

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !data.is_empty() {
                queue.push(AudioFrame::new(downmix(data, channels), sample_rate));
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Averages interleaved channels into normalized mono samples.
pub(crate) fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Copy,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            frame.iter().map(|&s| f32::from_sample_(s)).sum::<f32>() / frame.len() as f32
        })
        .collect()
}

/// Picks the supported range that covers `target_rate` with the fewest
/// channels, preferring float formats.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| format_rank(c.sample_format()).is_some())
        .filter(|c| c.min_sample_rate().0 <= target_rate && target_rate <= c.max_sample_rate().0)
        .min_by_key(|c| (c.channels(), format_rank(c.sample_format())))
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::F32 => Some(0),
        SampleFormat::I16 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn prefers_mono_float_covering_the_target() {
        let configs = vec![
            range(2, 8_000, 96_000, SampleFormat::F32),
            range(1, 8_000, 96_000, SampleFormat::I16),
            range(1, 8_000, 96_000, SampleFormat::F32),
            range(1, 44_100, 48_000, SampleFormat::F32),
        ];
        let chosen = find_supported_config(configs, 16_000).unwrap();
        assert_eq!(chosen.channels(), 1);
        assert_eq!(chosen.sample_format(), SampleFormat::F32);
        assert_eq!(chosen.min_sample_rate().0, 8_000);
    }

    #[test]
    fn no_covering_range_means_fallback() {
        let configs = vec![range(2, 44_100, 48_000, SampleFormat::F32)];
        assert!(find_supported_config(configs, 16_000).is_none());
    }

    #[test]
    fn downmix_averages_and_normalizes() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);

        let ints = [i16::MIN, i16::MIN, 16_384, 16_384];
        let mono = downmix(&ints, 2);
        assert_relative_eq!(mono[0], -1.0);
        assert_relative_eq!(mono[1], 0.5);
    }
}
