//! MIDI plumbing on the audio thread
//!
//! - `MidiBuffer`: fixed-capacity, offset-ordered event list per track
//! - Live MIDI queue: SPSC from the MIDI driver / UI thread to the callback
//! - Target resolution for live and generated notes

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mf_core::{MIDI_CHANNELS, MidiEvent, MidiMessage};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::track::Track;

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI BUFFER
// ═══════════════════════════════════════════════════════════════════════════════

/// Pre-allocated MIDI event list, kept sorted by offset
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    capacity: usize,
    overflowed: u64,
}

impl MidiBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            overflowed: 0,
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Insert after every event with the same or earlier offset.
    /// Returns false (and counts the overflow) when full.
    #[inline]
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() >= self.capacity {
            self.overflowed += 1;
            return false;
        }
        let pos = self.events.partition_point(|e| e.offset <= event.offset);
        self.events.insert(pos, event);
        true
    }

    /// All-notes-off and all-sound-off on every channel at `offset`
    pub fn push_panic(&mut self, offset: u32) {
        for channel in 0..MIDI_CHANNELS {
            self.push(MidiEvent::new(offset, MidiMessage::all_notes_off(channel)));
            self.push(MidiEvent::new(offset, MidiMessage::all_sound_off(channel)));
        }
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped because the buffer was full (cumulative)
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Take and reset the overflow count
    pub fn take_overflowed(&mut self) -> u64 {
        std::mem::take(&mut self.overflowed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE MIDI QUEUE
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer side of the live MIDI queue
pub struct LiveMidiSender {
    producer: Producer<MidiMessage>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side of the live MIDI queue (audio thread)
pub struct LiveMidiReceiver {
    consumer: Consumer<MidiMessage>,
}

/// Create a bounded live MIDI queue
pub fn live_midi_queue(capacity: usize) -> (LiveMidiSender, LiveMidiReceiver) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    (
        LiveMidiSender {
            producer,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        LiveMidiReceiver { consumer },
    )
}

impl LiveMidiSender {
    /// Queue a message; returns false when the queue is full
    pub fn send(&mut self, message: MidiMessage) -> bool {
        if self.producer.push(message).is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LiveMidiReceiver {
    #[inline]
    pub fn pop(&mut self) -> Option<MidiMessage> {
        self.consumer.pop().ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TARGET RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Track that receives live and generated notes.
///
/// Priority: first armed, first monitoring, the selected track, first
/// MIDI-capable, then track 0. `None` only when there are no tracks.
pub fn resolve_midi_target(tracks: &[Arc<dyn Track>], selected: Option<usize>) -> Option<usize> {
    if tracks.is_empty() {
        return None;
    }
    tracks
        .iter()
        .position(|t| t.is_armed())
        .or_else(|| tracks.iter().position(|t| t.is_monitoring()))
        .or_else(|| selected.filter(|&s| s < tracks.len()))
        .or_else(|| tracks.iter().position(|t| t.accepts_midi()))
        .or(Some(0))
}
