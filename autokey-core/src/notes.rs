//! # Musical Note Module
//!
//! Equal-temperament arithmetic for the detector: frequency to MIDI note
//! conversion, pitch classes, and the name tables shared with the MIDI side.
//!
//! ## Features
//! - Frequency to MIDI note number (A4 = 440 Hz = note 69)
//! - Pitch class reduction modulo one octave
//! - Note name lookups, including flat aliases
//! - Octave-4 tonic notes for downstream key messages

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

/// Sharp-spelled names for the twelve pitch classes, starting at C.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// MIDI note number of C4. Tonics are reported in this octave.
pub const TONIC_OCTAVE_BASE: u8 = 60;

/// A pitch reduced modulo one octave, `0 = C` through `11 = B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PitchClass(u8);

impl PitchClass {
    /// Builds a pitch class, returning `None` outside `0..=11`.
    pub fn new(value: u8) -> Option<Self> {
        (value < 12).then_some(Self(value))
    }

    /// Reduces any MIDI note number to its pitch class.
    pub fn from_midi_note(note: i32) -> Self {
        Self(note.rem_euclid(12) as u8)
    }

    /// Converts a frequency straight to its pitch class.
    ///
    /// Returns `None` for silence (non-positive) or non-finite input so the
    /// caller never records a bogus observation.
    pub fn from_frequency(freq: f32) -> Option<Self> {
        freq_to_midi_note(freq).map(Self::from_midi_note)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        NOTE_NAMES[self.0 as usize]
    }

    /// Semitone distance from `tonic` going upward, in `0..12`.
    pub fn offset_from(self, tonic: PitchClass) -> u8 {
        (self.0 + 12 - tonic.0) % 12
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static map from note names (sharps and flats) to pitch classes.
static NAME_MAP: Lazy<BTreeMap<&'static str, u8>> = Lazy::new(|| {
    let mut map: BTreeMap<&'static str, u8> = NOTE_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i as u8))
        .collect();
    for (alias, value) in [("Db", 1), ("Eb", 3), ("Gb", 6), ("Ab", 8), ("Bb", 10)] {
        map.insert(alias, value);
    }
    map
});

/// Converts a frequency in Hz to the nearest MIDI note number.
///
/// `midi = round(69 + 12 * log2(freq / 440))`. Note 0 and below count as
/// no note.
pub fn freq_to_midi_note(freq: f32) -> Option<i32> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let note = (69.0 + 12.0 * (freq / 440.0).log2()).round();
    (note.is_finite() && note >= 1.0).then_some(note as i32)
}

/// Looks up a pitch class by name, e.g. `"C#"` or `"Bb"`.
pub fn pitch_class_from_name(name: &str) -> Option<PitchClass> {
    NAME_MAP.get(name.trim()).copied().map(PitchClass)
}

/// The octave-4 MIDI note for a tonic (`C = 60` ... `B = 71`).
pub fn tonic_midi_note(tonic: PitchClass) -> u8 {
    TONIC_OCTAVE_BASE + tonic.value()
}

/// Frequency of a MIDI note in equal temperament.
pub fn midi_note_to_freq(note: i32) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn concert_a_is_note_69() {
        assert_eq!(freq_to_midi_note(440.0), Some(69));
        assert_eq!(PitchClass::from_frequency(440.0).map(PitchClass::name), Some("A"));
    }

    #[test]
    fn middle_c_rounds_to_pitch_class_zero() {
        assert_eq!(freq_to_midi_note(261.63), Some(60));
        assert_eq!(PitchClass::from_frequency(258.0), PitchClass::new(0));
    }

    #[test]
    fn silence_and_garbage_have_no_note() {
        assert_eq!(freq_to_midi_note(0.0), None);
        assert_eq!(freq_to_midi_note(-12.0), None);
        assert_eq!(freq_to_midi_note(f32::NAN), None);
        assert_eq!(freq_to_midi_note(f32::INFINITY), None);
        // Sub-audio readings round to note 0 or below and carry no note.
        assert_eq!(freq_to_midi_note(8.0), None);
        assert_eq!(PitchClass::from_frequency(8.0), None);
        assert_eq!(freq_to_midi_note(9.0), Some(2));
    }

    #[test]
    fn low_notes_wrap_into_range() {
        assert_eq!(PitchClass::from_midi_note(-1).value(), 11);
        assert_eq!(PitchClass::from_midi_note(12).value(), 0);
    }

    #[test]
    fn offsets_wrap_upward() {
        let a = PitchClass::new(9).unwrap();
        let c = PitchClass::new(0).unwrap();
        assert_eq!(c.offset_from(a), 3);
        assert_eq!(a.offset_from(c), 9);
    }

    #[test]
    fn names_resolve_with_flat_aliases() {
        assert_eq!(pitch_class_from_name("C").map(PitchClass::value), Some(0));
        assert_eq!(pitch_class_from_name("Db"), pitch_class_from_name("C#"));
        assert_eq!(pitch_class_from_name("Bb").map(PitchClass::value), Some(10));
        assert_eq!(pitch_class_from_name("H"), None);
    }

    #[test]
    fn tonics_land_in_octave_four() {
        assert_eq!(tonic_midi_note(PitchClass::new(0).unwrap()), 60);
        assert_eq!(tonic_midi_note(PitchClass::new(11).unwrap()), 71);
        assert_relative_eq!(midi_note_to_freq(69), 440.0);
    }
}
