//! Bounded frame queue between a capture backend and the analysis thread.
//!
//! Backed by a bounded crossbeam channel. The producer never waits: when the
//! queue is full the oldest unread frame is discarded so the newest audio
//! always gets in, and the drop is counted as an overrun.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Overruns are logged on the first drop and then every this many drops.
pub(crate) const OVERRUN_LOG_INTERVAL: u64 = 100;

/// Mono samples in `[-1.0, 1.0]` plus the rate they were captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples.len() as f32 / self.sample_rate as f32
        }
    }
}

/// Result of a bounded wait on the queue.
#[derive(Debug, PartialEq)]
pub enum Pop {
    Frame(AudioFrame),
    /// Nothing arrived before the timeout.
    Empty,
    /// Every producer handle is gone.
    Closed,
}

/// Cloneable handle to one run's frame queue.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<AudioFrame>,
    rx: Receiver<AudioFrame>,
    overruns: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            overruns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueues without blocking, evicting the oldest frame when full.
    ///
    /// Safe to call from an audio callback: no waits and no unbounded growth.
    pub fn push(&self, frame: AudioFrame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    // The consumer may win the race and empty a slot first;
                    // either way the retry below makes progress.
                    let _ = self.rx.try_recv();
                    self.record_overrun("frame queue full, dropped oldest frame");
                    frame = rejected;
                }
                // Both ends live in this handle, so this cannot happen while
                // `self` exists; treat it as a dropped frame anyway.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Counts one lost block of audio and logs the first loss and every
    /// `OVERRUN_LOG_INTERVAL`-th one. Returns the run's total so far.
    pub(crate) fn record_overrun(&self, what: &str) -> u64 {
        let dropped = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % OVERRUN_LOG_INTERVAL == 0 {
            warn!("Audio overrun: {what} ({dropped} total)");
        }
        dropped
    }

    /// Waits up to `timeout` for the next frame, in FIFO order.
    pub fn pop(&self, timeout: Duration) -> Pop {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Pop::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Pop::Empty,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    /// Frames discarded because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: f32) -> AudioFrame {
        AudioFrame::new(vec![tag; 4], 16_000)
    }

    #[test]
    fn pops_in_push_order() {
        let queue = FrameQueue::bounded(8);
        for i in 0..3 {
            queue.push(frame(i as f32));
        }
        for i in 0..3 {
            assert_eq!(queue.pop(Duration::from_millis(10)), Pop::Frame(frame(i as f32)));
        }
    }

    #[test]
    fn full_queue_drops_oldest_and_never_grows() {
        let queue = FrameQueue::bounded(2);
        for i in 0..5 {
            queue.push(frame(i as f32));
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(queue.overruns(), 3);
        assert_eq!(queue.pop(Duration::from_millis(10)), Pop::Frame(frame(3.0)));
        assert_eq!(queue.pop(Duration::from_millis(10)), Pop::Frame(frame(4.0)));
    }

    #[test]
    fn overruns_from_other_stages_share_the_counter() {
        let queue = FrameQueue::bounded(2);
        assert_eq!(queue.record_overrun("hand-off full"), 1);
        queue.push(frame(0.0));
        queue.push(frame(1.0));
        queue.push(frame(2.0));
        assert_eq!(queue.overruns(), 2);
    }

    #[test]
    fn pop_times_out_when_empty() {
        let queue = FrameQueue::bounded(2);
        assert_eq!(queue.pop(Duration::from_millis(5)), Pop::Empty);
        assert!(queue.is_empty());
    }

    #[test]
    fn frame_duration_follows_rate() {
        assert_eq!(AudioFrame::new(vec![0.0; 8000], 16_000).duration_secs(), 0.5);
        assert_eq!(AudioFrame::new(vec![0.0; 10], 0).duration_secs(), 0.0);
    }
}
