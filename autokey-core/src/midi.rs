//! MIDI messages for downstream pitch-correction plugins.
//!
//! A detected key goes out as a short note: the tonic in octave 4, with
//! velocity 127 for major and 64 for minor. Detection on/off is mirrored on
//! a controller so the plugin can follow along.

use log::{debug, warn};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::history::{KeyScale, Scale};
use crate::notes::tonic_midi_note;

/// Controller that mirrors whether detection is running.
pub const CC_DETECTION_ACTIVE: u8 = 37;

pub const VELOCITY_MAJOR: u8 = 127;
pub const VELOCITY_MINOR: u8 = 64;

/// Gap between Note-On and Note-Off for a key announcement.
pub const NOTE_GAP: Duration = Duration::from_millis(50);

/// Raw three-byte channel messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiMessage {
    pub bytes: [u8; 3],
}

impl MidiMessage {
    pub fn control_change(channel: u8, cc_number: u8, value: u8) -> Self {
        Self {
            bytes: [0xB0 | channel.min(15), cc_number & 0x7F, value & 0x7F],
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            bytes: [0x90 | channel.min(15), note & 0x7F, velocity & 0x7F],
        }
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self {
            bytes: [0x80 | channel.min(15), note & 0x7F, velocity & 0x7F],
        }
    }
}

/// Where MIDI bytes end up: a hardware or virtual port in the binary, a
/// recorder in tests.
pub trait MidiSink {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
}

pub struct MidiController<S: MidiSink> {
    sink: S,
    channel: u8,
    note_gap: Duration,
    last_sent: HashMap<u8, u8>,
}

impl<S: MidiSink> MidiController<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            channel: 0,
            note_gap: NOTE_GAP,
            last_sent: HashMap::new(),
        }
    }

    pub fn with_note_gap(mut self, gap: Duration) -> Self {
        self.note_gap = gap;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Sends a control change, clamped to `0..=127`. Repeats of the value
    /// last sent on the same controller are skipped.
    pub fn send_cc(&mut self, cc: u8, value: i32) -> Result<()> {
        let value = value.clamp(0, 127) as u8;
        if self.last_sent.get(&cc) == Some(&value) {
            return Ok(());
        }
        self.sink
            .send(&MidiMessage::control_change(self.channel, cc, value).bytes)?;
        self.last_sent.insert(cc, value);
        debug!("MIDI send: CC {cc} -> {value}");
        Ok(())
    }

    /// Announces a key as Note-On, a short gap, then Note-Off.
    pub fn send_key_scale(&mut self, key: &KeyScale) -> Result<()> {
        let note = tonic_midi_note(key.tonic);
        let velocity = match key.scale {
            Scale::Major => VELOCITY_MAJOR,
            Scale::Minor => VELOCITY_MINOR,
        };
        self.sink
            .send(&MidiMessage::note_on(self.channel, note, velocity).bytes)?;
        if !self.note_gap.is_zero() {
            thread::sleep(self.note_gap);
        }
        if let Err(e) = self
            .sink
            .send(&MidiMessage::note_off(self.channel, note, 0).bytes)
        {
            warn!("Note-Off for {key} failed; the note may hang: {e}");
            return Err(e);
        }
        debug!("MIDI send: note {note} velocity {velocity} ({key})");
        Ok(())
    }

    pub fn set_detection_active(&mut self, active: bool) -> Result<()> {
        self.send_cc(CC_DETECTION_ACTIVE, if active { 127 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectorError;
    use crate::notes::PitchClass;

    #[derive(Default)]
    struct Recording {
        sent: Vec<Vec<u8>>,
        fail: bool,
    }

    impl MidiSink for Recording {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            if self.fail {
                return Err(DetectorError::Midi("port closed".into()));
            }
            self.sent.push(bytes.to_vec());
            Ok(())
        }
    }

    fn controller() -> MidiController<Recording> {
        MidiController::new(Recording::default()).with_note_gap(Duration::ZERO)
    }

    fn key(tonic: u8, scale: Scale) -> KeyScale {
        KeyScale {
            tonic: PitchClass::new(tonic).unwrap(),
            scale,
        }
    }

    #[test]
    fn repeated_cc_values_are_skipped() {
        let mut midi = controller();
        midi.send_cc(28, 64).unwrap();
        midi.send_cc(28, 64).unwrap();
        midi.send_cc(28, 65).unwrap();
        midi.send_cc(29, 64).unwrap();
        assert_eq!(
            midi.sink().sent,
            vec![vec![0xB0, 28, 64], vec![0xB0, 28, 65], vec![0xB0, 29, 64]]
        );
    }

    #[test]
    fn cc_values_are_clamped() {
        let mut midi = controller();
        midi.send_cc(28, 300).unwrap();
        midi.send_cc(28, -5).unwrap();
        assert_eq!(midi.sink().sent, vec![vec![0xB0, 28, 127], vec![0xB0, 28, 0]]);
    }

    #[test]
    fn key_announcements_use_tonic_note_and_scale_velocity() {
        let mut midi = controller();
        midi.send_key_scale(&key(0, Scale::Major)).unwrap();
        midi.send_key_scale(&key(1, Scale::Minor)).unwrap();
        assert_eq!(
            midi.sink().sent,
            vec![
                vec![0x90, 60, 127],
                vec![0x80, 60, 0],
                vec![0x90, 61, 64],
                vec![0x80, 61, 0],
            ]
        );
    }

    #[test]
    fn detection_state_goes_out_on_cc_37() {
        let mut midi = controller();
        midi.set_detection_active(true).unwrap();
        midi.set_detection_active(true).unwrap();
        midi.set_detection_active(false).unwrap();
        assert_eq!(midi.sink().sent, vec![vec![0xB0, 37, 127], vec![0xB0, 37, 0]]);
    }

    #[test]
    fn failed_cc_is_not_cached() {
        let mut midi = MidiController::new(Recording {
            fail: true,
            ..Default::default()
        });
        assert!(midi.send_cc(37, 127).is_err());
        midi.sink.fail = false;
        midi.send_cc(37, 127).unwrap();
        assert_eq!(midi.sink().sent, vec![vec![0xB0, 37, 127]]);
    }
}
