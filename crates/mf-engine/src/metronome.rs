//! Metronome
//!
//! A short decaying sine click at every beat boundary the block crosses,
//! accented on the downbeat of each 4-beat bar. Click sounds are generated
//! at prepare time; the audio thread only plays them back.

use std::f64::consts::TAU;

use mf_core::Sample;

use crate::transport::BlockSegment;

/// Beats per bar for accenting
pub const BEATS_PER_BAR: i64 = 4;

/// Click type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickKind {
    /// Bar downbeat
    Accent,
    /// Other beats
    Beat,
}

/// Pre-rendered click
#[derive(Debug, Clone)]
struct ClickSound {
    samples: Vec<Sample>,
}

impl ClickSound {
    /// Sine burst with exponential decay
    fn generate(sample_rate: f64, freq: f64, duration: f64, gain: f64) -> Self {
        let len = (sample_rate * duration) as usize;
        let samples = (0..len)
            .map(|i| {
                let t = i as f64 / sample_rate;
                (t * freq * TAU).sin() * (-t * 40.0).exp() * gain
            })
            .collect();
        Self { samples }
    }
}

/// Click generator
pub struct Metronome {
    accent: ClickSound,
    beat: ClickSound,
    playing: Option<ClickKind>,
    position: usize,
}

impl Metronome {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            accent: ClickSound::generate(sample_rate, 1000.0, 0.015, 0.8),
            beat: ClickSound::generate(sample_rate, 800.0, 0.012, 0.5),
            playing: None,
            position: 0,
        }
    }

    pub fn prepare(&mut self, sample_rate: f64) {
        *self = Self::new(sample_rate);
    }

    pub fn reset(&mut self) {
        self.playing = None;
        self.position = 0;
    }

    /// Sum clicks for the block's segments into `left`/`right` at `level`
    pub fn render(&mut self, segments: &[BlockSegment], left: &mut [Sample], right: &mut [Sample], level: f64) {
        let n = left.len().min(right.len());
        let mut cursor = 0;

        for segment in segments {
            let bps = segment.beats_per_sample();
            if bps <= 0.0 {
                continue;
            }
            // Integer beats in [start, end)
            let mut beat = segment.start_beat.ceil();
            while beat < segment.end_beat {
                let offset = segment.offset + ((beat - segment.start_beat) / bps).round() as usize;
                if offset >= n {
                    break;
                }
                self.play_until(offset, cursor, left, right, level);
                cursor = offset;
                let kind = if (beat as i64).rem_euclid(BEATS_PER_BAR) == 0 {
                    ClickKind::Accent
                } else {
                    ClickKind::Beat
                };
                self.playing = Some(kind);
                self.position = 0;
                beat += 1.0;
            }
        }
        self.play_until(n, cursor, left, right, level);
    }

    /// Continue the current click over `[from, to)`
    fn play_until(&mut self, to: usize, from: usize, left: &mut [Sample], right: &mut [Sample], level: f64) {
        let Some(kind) = self.playing else {
            return;
        };
        let sound = match kind {
            ClickKind::Accent => &self.accent.samples,
            ClickKind::Beat => &self.beat.samples,
        };
        let mut i = from;
        while i < to && self.position < sound.len() {
            let s = sound[self.position] * level;
            left[i] += s;
            right[i] += s;
            i += 1;
            self.position += 1;
        }
        if self.position >= sound.len() {
            self.playing = None;
        }
    }

    pub fn is_clicking(&self) -> Option<ClickKind> {
        self.playing
    }
}
