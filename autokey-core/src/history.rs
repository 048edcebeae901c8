//! # Pitch History and Key/Scale Classification
//!
//! A bounded FIFO of recent pitch classes and the counting classifier that
//! turns it into a tonic plus a major/minor decision.
//!
//! The classifier is deliberately simple: the most frequent pitch class is
//! the tonic, and the scale is whichever reference pattern shares more
//! intervals with the notes heard more than once. Ties for the tonic go to
//! the class encountered first in the history, which is deterministic but
//! carries no music-theory meaning.

use std::collections::VecDeque;
use std::fmt;

use crate::notes::PitchClass;

/// Offsets from the tonic that make up a major scale.
const MAJOR_PATTERN: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
/// Offsets from the tonic that make up a natural minor scale.
const MINOR_PATTERN: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

/// Weight of the newest cycle in the observation-rate average.
const RATE_SMOOTHING: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scale {
    Major,
    Minor,
}

impl Scale {
    pub fn as_str(self) -> &'static str {
        match self {
            Scale::Major => "major",
            Scale::Minor => "minor",
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected key: tonic pitch class plus scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyScale {
    pub tonic: PitchClass,
    pub scale: Scale,
}

impl KeyScale {
    pub fn tonic_name(&self) -> &'static str {
        self.tonic.name()
    }
}

impl fmt::Display for KeyScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tonic, self.scale)
    }
}

/// Classifies a sequence of pitch classes.
///
/// Returns `None` only when there is no evidence at all; evidence gating
/// belongs to [`PitchHistory::key_scale`].
pub fn classify(pitches: &[PitchClass]) -> Option<KeyScale> {
    let mut counts = [0usize; 12];
    let mut first_seen = [usize::MAX; 12];
    for (position, pc) in pitches.iter().enumerate() {
        let i = pc.value() as usize;
        counts[i] += 1;
        if first_seen[i] == usize::MAX {
            first_seen[i] = position;
        }
    }

    // Highest count wins; among equal counts, the earliest first sighting.
    let tonic = (0..12)
        .filter(|&i| counts[i] > 0)
        .max_by(|&a, &b| {
            counts[a]
                .cmp(&counts[b])
                .then_with(|| first_seen[b].cmp(&first_seen[a]))
        })
        .and_then(|i| PitchClass::new(i as u8))?;

    let mut major_score = 0;
    let mut minor_score = 0;
    for (i, &count) in counts.iter().enumerate() {
        if count <= 1 {
            continue;
        }
        let Some(pc) = PitchClass::new(i as u8) else {
            continue;
        };
        let offset = pc.offset_from(tonic);
        if MAJOR_PATTERN.contains(&offset) {
            major_score += 1;
        }
        if MINOR_PATTERN.contains(&offset) {
            minor_score += 1;
        }
    }

    let scale = if major_score >= minor_score {
        Scale::Major
    } else {
        Scale::Minor
    };
    Some(KeyScale { tonic, scale })
}

/// Recent pitch classes, oldest first. Appending is the only way in.
#[derive(Debug, Clone)]
pub struct PitchHistory {
    entries: VecDeque<PitchClass>,
    bound: usize,
}

impl PitchHistory {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            entries: VecDeque::with_capacity(bound),
            bound,
        }
    }

    /// Appends one observation, evicting from the front past the bound.
    pub fn push(&mut self, pc: PitchClass) {
        self.entries.push_back(pc);
        self.evict();
    }

    /// Changes the bound, evicting the oldest entries immediately if the
    /// history is now too long.
    pub fn set_bound(&mut self, bound: usize) {
        self.bound = bound.max(1);
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.bound {
            self.entries.pop_front();
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PitchClass> + '_ {
        self.entries.iter().copied()
    }

    /// Classifies the history once it holds at least `min_evidence` entries.
    pub fn key_scale(&self, min_evidence: usize) -> Option<KeyScale> {
        if self.entries.len() < min_evidence {
            return None;
        }
        let (front, back) = self.entries.as_slices();
        if back.is_empty() {
            classify(front)
        } else {
            let contiguous: Vec<PitchClass> = self.entries.iter().copied().collect();
            classify(&contiguous)
        }
    }
}

/// Heuristic "effective window" for the history.
///
/// Keeps a moving average of valid observations per second of analysed
/// audio and converts the target window length into an entry count. The
/// result approximates a fixed time span whichever estimator is active; it
/// is not a wall-clock timer.
#[derive(Debug, Clone)]
pub struct AdaptiveWindow {
    window_seconds: f32,
    min_bound: usize,
    max_bound: usize,
    rate: Option<f32>,
}

impl AdaptiveWindow {
    pub fn new(window_seconds: f32, min_bound: usize, max_bound: usize) -> Self {
        let min_bound = min_bound.max(1);
        Self {
            window_seconds,
            min_bound,
            max_bound: max_bound.max(min_bound),
            rate: None,
        }
    }

    /// Folds in one processing cycle. Cycles with no valid observations
    /// (silence) leave the rate untouched so a pause does not flush the
    /// history.
    pub fn observe_cycle(&mut self, valid_observations: usize, cycle_seconds: f32) {
        if valid_observations == 0 || cycle_seconds.is_nan() || cycle_seconds <= 0.0 {
            return;
        }
        let cycle_rate = valid_observations as f32 / cycle_seconds;
        self.rate = Some(match self.rate {
            None => cycle_rate,
            Some(rate) => rate + RATE_SMOOTHING * (cycle_rate - rate),
        });
    }

    /// Current history bound. Before any voiced cycle the ceiling applies.
    pub fn bound(&self) -> usize {
        match self.rate {
            None => self.max_bound,
            Some(rate) => {
                let wanted = (self.window_seconds * rate).round();
                if wanted.is_finite() && wanted > 0.0 {
                    (wanted as usize).clamp(self.min_bound, self.max_bound)
                } else {
                    self.min_bound
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcs(values: &[u8]) -> Vec<PitchClass> {
        values.iter().map(|&v| PitchClass::new(v).unwrap()).collect()
    }

    #[test]
    fn c_major_scenario() {
        let result = classify(&pcs(&[0, 0, 0, 4, 4, 7])).unwrap();
        assert_eq!(result.tonic_name(), "C");
        assert_eq!(result.scale, Scale::Major);
    }

    #[test]
    fn a_minor_scenario() {
        let result = classify(&pcs(&[9, 9, 9, 0, 0, 4])).unwrap();
        assert_eq!(result.tonic_name(), "A");
        assert_eq!(result.scale, Scale::Minor);
        assert_eq!(result.to_string(), "A minor");
    }

    #[test]
    fn empty_evidence_has_no_result() {
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn majority_class_is_always_the_tonic() {
        // Every class in turn holds a strict majority over a fixed background.
        let background = pcs(&[1, 2, 3, 5, 6, 8, 10, 11, 2, 5]);
        for tonic in 0..12u8 {
            let mut pitches = background.clone();
            pitches.extend(pcs(&vec![tonic; 11]));
            let result = classify(&pitches).unwrap();
            assert_eq!(result.tonic.value(), tonic);
        }
    }

    #[test]
    fn ties_go_to_the_first_class_heard() {
        let result = classify(&pcs(&[7, 2, 2, 7])).unwrap();
        assert_eq!(result.tonic.value(), 7);
        let result = classify(&pcs(&[2, 7, 7, 2])).unwrap();
        assert_eq!(result.tonic.value(), 2);
    }

    #[test]
    fn scale_ties_favor_major() {
        // Only the tonic repeats: offset {0} matches both patterns.
        let result = classify(&pcs(&[5, 5, 1])).unwrap();
        assert_eq!(result.scale, Scale::Major);
    }

    #[test]
    fn classification_is_idempotent() {
        let mut history = PitchHistory::new(64);
        for v in [9, 9, 0, 4, 9, 0, 2, 7, 9, 11, 4, 4, 5, 9, 0, 3, 3, 8, 8, 10, 9, 0] {
            history.push(PitchClass::new(v).unwrap());
        }
        let first = history.key_scale(20);
        assert!(first.is_some());
        assert_eq!(history.key_scale(20), first);
    }

    #[test]
    fn short_history_is_not_classified() {
        let mut history = PitchHistory::new(64);
        for _ in 0..12 {
            history.push(PitchClass::new(0).unwrap());
        }
        assert_eq!(history.key_scale(20), None);
    }

    #[test]
    fn history_never_exceeds_its_bound_and_evicts_oldest() {
        let mut history = PitchHistory::new(5);
        for v in 0..200u32 {
            history.push(PitchClass::new((v % 12) as u8).unwrap());
            assert!(history.len() <= history.bound());
        }
        let kept: Vec<u8> = history.iter().map(PitchClass::value).collect();
        assert_eq!(kept, vec![3, 4, 5, 6, 7]);

        history.set_bound(2);
        let kept: Vec<u8> = history.iter().map(PitchClass::value).collect();
        assert_eq!(kept, vec![6, 7]);
    }

    #[test]
    fn wrapped_history_classifies_like_a_flat_one() {
        let mut history = PitchHistory::new(20);
        for v in [1u8; 10] {
            history.push(PitchClass::new(v).unwrap());
        }
        let tail = pcs(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, 4, 7, 7, 2, 2, 9, 9, 11]);
        for pc in &tail {
            history.push(*pc);
        }
        assert_eq!(history.key_scale(20), classify(&tail));
    }

    #[test]
    fn adaptive_window_tracks_observation_rate() {
        let mut window = AdaptiveWindow::new(5.0, 20, 2048);
        assert_eq!(window.bound(), 2048);

        // Low-latency pace: one observation per 1024-sample block at 16 kHz.
        for _ in 0..50 {
            window.observe_cycle(1, 1024.0 / 16_000.0);
        }
        assert_eq!(window.bound(), 78);

        // Silence and degenerate cycle lengths leave it alone.
        window.observe_cycle(0, 1.0);
        window.observe_cycle(5, f32::NAN);
        window.observe_cycle(5, 0.0);
        assert_eq!(window.bound(), 78);
    }

    #[test]
    fn adaptive_window_respects_floor_and_ceiling() {
        let mut sparse = AdaptiveWindow::new(5.0, 20, 100);
        sparse.observe_cycle(1, 1.0);
        assert_eq!(sparse.bound(), 20);

        let mut dense = AdaptiveWindow::new(5.0, 20, 100);
        dense.observe_cycle(1000, 1.0);
        assert_eq!(dense.bound(), 100);
    }
}
