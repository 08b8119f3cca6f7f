//! MIDI Types and Events
//!
//! Provides the short-message MIDI 1.0 subset the engine routes:
//! - Note On/Off, Control Change, Pitch Bend
//! - Sample-offset stamped events for block processing
//! - Transposition and panic (all-notes-off) helpers

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// MIDI 1.0 status bytes
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const PITCH_BEND: u8 = 0xE0;
}

/// Control change numbers used by the engine
pub mod cc {
    pub const SUSTAIN: u8 = 64;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const ALL_NOTES_OFF: u8 = 123;
}

/// Number of MIDI channels
pub const MIDI_CHANNELS: u8 = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI MESSAGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Three-byte MIDI 1.0 channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiMessage {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl MidiMessage {
    #[inline]
    pub const fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self { status, data1, data2 }
    }

    pub const fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(status::NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F)
    }

    pub const fn note_off(channel: u8, note: u8) -> Self {
        Self::new(status::NOTE_OFF | (channel & 0x0F), note & 0x7F, 0)
    }

    pub const fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::new(
            status::CONTROL_CHANGE | (channel & 0x0F),
            controller & 0x7F,
            value & 0x7F,
        )
    }

    pub const fn all_notes_off(channel: u8) -> Self {
        Self::control_change(channel, cc::ALL_NOTES_OFF, 0)
    }

    pub const fn all_sound_off(channel: u8) -> Self {
        Self::control_change(channel, cc::ALL_SOUND_OFF, 0)
    }

    /// Channel nibble (0-15)
    #[inline]
    pub fn channel(&self) -> u8 {
        self.status & 0x0F
    }

    /// Status nibble without channel
    #[inline]
    pub fn kind(&self) -> u8 {
        self.status & 0xF0
    }

    /// Note On with non-zero velocity
    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.kind() == status::NOTE_ON && self.data2 > 0
    }

    /// Note Off, or Note On with zero velocity
    #[inline]
    pub fn is_note_off(&self) -> bool {
        self.kind() == status::NOTE_OFF || (self.kind() == status::NOTE_ON && self.data2 == 0)
    }

    #[inline]
    pub fn is_note(&self) -> bool {
        matches!(self.kind(), status::NOTE_ON | status::NOTE_OFF)
    }

    /// Note number for note messages
    #[inline]
    pub fn note(&self) -> Option<u8> {
        self.is_note().then_some(self.data1)
    }

    /// Shift a note message by `semitones`. Non-note messages pass through.
    /// Returns `None` when the shifted note leaves the 0..=127 range.
    pub fn transposed(&self, semitones: i32) -> Option<Self> {
        if !self.is_note() || semitones == 0 {
            return Some(*self);
        }
        let note = self.data1 as i32 + semitones;
        (0..=127).contains(&note).then(|| Self::new(self.status, note as u8, self.data2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIMED EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// MIDI message stamped with a sample offset inside the current block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample offset from the start of the block
    pub offset: u32,
    pub message: MidiMessage,
}

impl MidiEvent {
    #[inline]
    pub const fn new(offset: u32, message: MidiMessage) -> Self {
        Self { offset, message }
    }
}

/// MIDI message stamped with a beat position (clip content, recorded takes)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatMidiEvent {
    /// Position in beats (clip-relative for clip content, absolute for takes)
    pub beat: f64,
    pub message: MidiMessage,
}

impl BeatMidiEvent {
    #[inline]
    pub const fn new(beat: f64, message: MidiMessage) -> Self {
        Self { beat, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_classification() {
        let on = MidiMessage::note_on(3, 60, 100);
        assert!(on.is_note_on());
        assert_eq!(on.channel(), 3);
        assert_eq!(on.note(), Some(60));

        let zero_vel = MidiMessage::note_on(0, 60, 0);
        assert!(zero_vel.is_note_off());
        assert!(!zero_vel.is_note_on());

        let cc = MidiMessage::all_notes_off(15);
        assert!(!cc.is_note());
        assert_eq!(cc.data1, cc::ALL_NOTES_OFF);
        assert_eq!(cc.channel(), 15);
    }

    #[test]
    fn test_transpose() {
        let on = MidiMessage::note_on(0, 60, 100);
        assert_eq!(on.transposed(12).and_then(|m| m.note()), Some(72));
        assert_eq!(on.transposed(-61), None);
        assert_eq!(MidiMessage::note_on(0, 120, 1).transposed(8), None);

        let cc = MidiMessage::control_change(0, 7, 100);
        assert_eq!(cc.transposed(5), Some(cc));
    }
}
