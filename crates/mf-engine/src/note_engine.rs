//! Note-engine contract
//!
//! Chord/arpeggio generation lives outside the engine. Incoming live
//! messages are handed to a [`NoteEngine`], which schedules its output on a
//! [`NoteScheduler`]; once per block the engine collects everything due in
//! the block into the routed track's MIDI buffer.

use mf_core::{MidiEvent, MidiMessage};

use crate::midi::MidiBuffer;

/// Note generation contract
pub trait NoteEngine: Send {
    /// Ingest one live message. Output goes through `scheduler`.
    fn process_incoming(&mut self, message: MidiMessage, scheduler: &mut NoteScheduler);

    /// Emit free-running output for the coming block (offsets relative to it)
    fn process(&mut self, block_size: usize, sample_rate: f64, output: &mut MidiBuffer);

    /// Forget held notes and pending output
    fn reset(&mut self) {}
}

/// Fixed-capacity queue of future MIDI messages, timed in samples
#[derive(Debug, Clone)]
pub struct NoteScheduler {
    pending: Vec<(u64, MidiMessage)>,
    capacity: usize,
    /// Absolute sample position of the current block start
    now: u64,
    dropped: u64,
}

impl NoteScheduler {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
            now: 0,
            dropped: 0,
        }
    }

    /// Schedule `message` `delay` samples after the current block start
    pub fn schedule(&mut self, delay: u64, message: MidiMessage) -> bool {
        if self.pending.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.pending.push((self.now + delay, message));
        true
    }

    /// Move every message due before `now + block_size` into `output`, then
    /// advance to the next block.
    pub fn drain_block(&mut self, block_size: usize, output: &mut MidiBuffer) {
        let end = self.now + block_size as u64;
        let now = self.now;
        self.pending.retain(|&(due, message)| {
            if due < end {
                let offset = due.saturating_sub(now) as u32;
                output.push(MidiEvent::new(offset, message));
                false
            } else {
                true
            }
        });
        self.now = end;
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEQUENCE NOTE ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum chord size
const MAX_CHORD: usize = 8;

/// Reference note engine: forwards notes, optionally stacking a chord on
/// each one, with an optional fixed delay.
#[derive(Debug, Clone)]
pub struct SequenceNoteEngine {
    intervals: [i8; MAX_CHORD],
    interval_count: usize,
    delay_samples: u64,
}

impl SequenceNoteEngine {
    pub fn new() -> Self {
        Self {
            intervals: [0; MAX_CHORD],
            interval_count: 1,
            delay_samples: 0,
        }
    }

    /// Stack semitone `intervals` on every note (0 = the played note)
    pub fn with_chord(mut self, intervals: &[i8]) -> Self {
        let count = intervals.len().min(MAX_CHORD);
        self.intervals[..count].copy_from_slice(&intervals[..count]);
        self.interval_count = count.max(1);
        if count == 0 {
            self.intervals[0] = 0;
        }
        self
    }

    pub fn with_delay(mut self, delay_samples: u64) -> Self {
        self.delay_samples = delay_samples;
        self
    }
}

impl Default for SequenceNoteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NoteEngine for SequenceNoteEngine {
    fn process_incoming(&mut self, message: MidiMessage, scheduler: &mut NoteScheduler) {
        if !message.is_note() {
            scheduler.schedule(self.delay_samples, message);
            return;
        }
        for &interval in &self.intervals[..self.interval_count] {
            if let Some(shifted) = message.transposed(interval as i32) {
                scheduler.schedule(self.delay_samples, shifted);
            }
        }
    }

    fn process(&mut self, _block_size: usize, _sample_rate: f64, _output: &mut MidiBuffer) {}
}
