//! Per-run analysis state: pitch history, its adaptive bound, and the
//! change gate in front of the detection callback.
//!
//! Everything here is owned by the analysis thread alone, so none of it
//! needs a lock.

use log::{debug, trace};

use crate::config::DetectorConfig;
use crate::estimator::PitchObservation;
use crate::history::{AdaptiveWindow, KeyScale, PitchHistory};

/// Lets a result through only when it differs from the last one let through.
#[derive(Debug, Default, Clone)]
pub struct ChangeGate {
    last_emitted: Option<KeyScale>,
}

impl ChangeGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(result)` on a change (including the very first result)
    /// and records it; returns `None` for a repeat.
    pub fn offer(&mut self, result: KeyScale) -> Option<KeyScale> {
        if self.last_emitted == Some(result) {
            return None;
        }
        self.last_emitted = Some(result);
        Some(result)
    }

    pub fn last_emitted(&self) -> Option<KeyScale> {
        self.last_emitted
    }
}

pub struct KeyTracker {
    history: PitchHistory,
    window: AdaptiveWindow,
    gate: ChangeGate,
    min_evidence: usize,
}

impl KeyTracker {
    pub fn new(config: &DetectorConfig) -> Self {
        let window = AdaptiveWindow::new(
            config.analysis_window_seconds,
            config.min_evidence,
            config.max_history,
        );
        Self {
            history: PitchHistory::new(window.bound()),
            window,
            gate: ChangeGate::new(),
            min_evidence: config.min_evidence,
        }
    }

    /// Feeds one estimator cycle covering `cycle_seconds` of audio.
    ///
    /// Returns the new key/scale only when it differs from the last one
    /// returned during this run.
    pub fn process_cycle(
        &mut self,
        observations: &[PitchObservation],
        cycle_seconds: f32,
    ) -> Option<KeyScale> {
        let mut valid = 0;
        for pc in observations.iter().filter_map(PitchObservation::pitch_class) {
            self.history.push(pc);
            valid += 1;
        }

        self.window.observe_cycle(valid, cycle_seconds);
        self.history.set_bound(self.window.bound());
        trace!(
            "Cycle: {valid} valid observations, history {}/{}",
            self.history.len(),
            self.history.bound()
        );

        let result = self.history.key_scale(self.min_evidence)?;
        let changed = self.gate.offer(result);
        if changed.is_none() {
            debug!("Key unchanged: {result}");
        }
        changed
    }

    pub fn history(&self) -> &PitchHistory {
        &self.history
    }

    pub fn last_emitted(&self) -> Option<KeyScale> {
        self.gate.last_emitted()
    }
}
