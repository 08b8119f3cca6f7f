//! Transport
//!
//! The control thread requests play/stop/locate through [`TransportShared`];
//! the audio thread owns the actual position in [`Transport`] and advances it
//! once per block, splitting the block into at most two beat segments when
//! it crosses the loop end.

use std::sync::atomic::{AtomicBool, Ordering};

use mf_core::TempoMap;
use portable_atomic::AtomicF64;

/// Transport requests and published position, shared across threads
#[derive(Debug, Default)]
pub struct TransportShared {
    playing: AtomicBool,
    locate_pending: AtomicBool,
    locate_beat: AtomicF64,
    /// Position at the start of the last processed block
    position: AtomicF64,
}

impl TransportShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
    }

    /// Move the play position; applied at the next block
    pub fn locate(&self, beat: f64) {
        if beat.is_finite() {
            self.locate_beat.store(beat.max(0.0), Ordering::Relaxed);
            self.locate_pending.store(true, Ordering::Release);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn position(&self) -> f64 {
        self.position.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK RANGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Contiguous beat range covering part of a block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockSegment {
    pub start_beat: f64,
    pub end_beat: f64,
    /// First sample of the segment within the block
    pub offset: usize,
    pub len: usize,
}

impl BlockSegment {
    /// Beats per sample across the segment (0 when stopped)
    #[inline]
    pub fn beats_per_sample(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            (self.end_beat - self.start_beat) / self.len as f64
        }
    }

    /// Whether `[start, end)` overlaps this segment
    #[inline]
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        start < self.end_beat && end > self.start_beat
    }
}

/// Beat segments for one block (one, or two on loop wrap)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockRange {
    segments: [BlockSegment; 2],
    count: usize,
    /// Transport is rolling in this block
    pub playing: bool,
    /// Transport went from playing to stopped at this block
    pub stopped: bool,
    /// Transport went from stopped to playing at this block
    pub started: bool,
    /// Position was relocated at this block
    pub located: bool,
}

impl BlockRange {
    pub fn segments(&self) -> &[BlockSegment] {
        &self.segments[..self.count]
    }

    pub fn start_beat(&self) -> f64 {
        self.segments[0].start_beat
    }

    pub fn wrapped(&self) -> bool {
        self.count == 2
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Audio-thread transport state
#[derive(Debug, Clone, Default)]
pub struct Transport {
    position: f64,
    playing: bool,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Advance by `frames` samples under `tempo`, honoring the loop region
    pub fn advance(
        &mut self,
        shared: &TransportShared,
        tempo: &TempoMap,
        loop_region: Option<(f64, f64)>,
        frames: usize,
        sample_rate: f64,
    ) -> BlockRange {
        let mut range = BlockRange::default();

        if shared.locate_pending.swap(false, Ordering::AcqRel) {
            self.position = shared.locate_beat.load(Ordering::Relaxed);
            range.located = true;
        }

        let playing = shared.is_playing();
        range.stopped = self.playing && !playing;
        range.started = !self.playing && playing;
        range.playing = playing;
        self.playing = playing;
        shared.position.store(self.position, Ordering::Relaxed);

        let start = self.position;
        if !playing || frames == 0 {
            range.segments[0] = BlockSegment {
                start_beat: start,
                end_beat: start,
                offset: 0,
                len: frames,
            };
            range.count = 1;
            return range;
        }

        let start_sample = tempo.samples_at(start, sample_rate);
        let end = tempo.beat_at_sample(start_sample + frames as f64, sample_rate);

        match loop_region {
            Some((loop_start, loop_end)) if start < loop_end && end > loop_end => {
                let to_end = tempo.samples_at(loop_end, sample_rate) - start_sample;
                let first = (to_end.round().max(0.0) as usize).min(frames);
                let remaining = frames - first;

                let wrap_sample = tempo.samples_at(loop_start, sample_rate);
                let wrap_end = tempo
                    .beat_at_sample(wrap_sample + remaining as f64, sample_rate)
                    .min(loop_end);

                let wrapped = BlockSegment {
                    start_beat: loop_start,
                    end_beat: wrap_end,
                    offset: first,
                    len: remaining,
                };
                if first == 0 {
                    range.segments[0] = wrapped;
                    range.count = 1;
                } else {
                    range.segments[0] = BlockSegment {
                        start_beat: start,
                        end_beat: loop_end,
                        offset: 0,
                        len: first,
                    };
                    range.segments[1] = wrapped;
                    range.count = if remaining > 0 { 2 } else { 1 };
                }
                self.position = if remaining > 0 { wrap_end } else { loop_start };
            }
            _ => {
                range.segments[0] = BlockSegment {
                    start_beat: start,
                    end_beat: end,
                    offset: 0,
                    len: frames,
                };
                range.count = 1;
                self.position = end;
            }
        }
        range
    }
}
