//! Tempo Map
//!
//! Beat-indexed tempo changes with piecewise-constant tempo between events:
//! - Instantaneous tempo lookup (`tempo_at`)
//! - Beat ↔ seconds ↔ samples conversion by integrating each tempo segment
//!
//! An event placed exactly at beat `b` is in effect from `b` onwards.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum tempo
pub const MIN_BPM: f64 = 1.0;

/// Tempo used when a map is built without any event
pub const DEFAULT_BPM: f64 = 120.0;

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO EVENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Tempo change event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEvent {
    /// Position in beats (>= 0)
    pub beat: f64,
    /// Tempo in BPM (>= 1)
    pub bpm: f64,
}

impl TempoEvent {
    pub fn new(beat: f64, bpm: f64) -> Self {
        Self {
            beat: if beat.is_finite() { beat.max(0.0) } else { 0.0 },
            bpm: if bpm.is_finite() { bpm.max(MIN_BPM) } else { DEFAULT_BPM },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Sorted tempo map that always contains an event at beat 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    events: Vec<TempoEvent>,
}

impl TempoMap {
    /// Constant-tempo map
    pub fn new(bpm: f64) -> Self {
        Self {
            events: vec![TempoEvent::new(0.0, bpm)],
        }
    }

    /// Build from arbitrary events: sorts, deduplicates equal beats (last wins)
    /// and guarantees an event at beat 0.
    pub fn from_events(events: impl IntoIterator<Item = TempoEvent>) -> Self {
        let mut map = Self { events: Vec::new() };
        for event in events {
            map.insert(event.beat, event.bpm);
        }
        map.ensure_origin();
        map
    }

    /// Insert or replace a tempo change
    pub fn insert(&mut self, beat: f64, bpm: f64) {
        let event = TempoEvent::new(beat, bpm);
        match self
            .events
            .binary_search_by(|e| e.beat.total_cmp(&event.beat))
        {
            Ok(idx) => self.events[idx] = event,
            Err(idx) => self.events.insert(idx, event),
        }
        self.ensure_origin();
    }

    /// Remove the change at `beat`. The origin event is never removed.
    pub fn remove(&mut self, beat: f64) -> bool {
        if beat <= 0.0 {
            return false;
        }
        let before = self.events.len();
        self.events.retain(|e| e.beat == 0.0 || (e.beat - beat).abs() > 1e-9);
        self.events.len() != before
    }

    fn ensure_origin(&mut self) {
        match self.events.first() {
            Some(first) if first.beat == 0.0 => {}
            Some(first) => {
                let bpm = first.bpm;
                self.events.insert(0, TempoEvent::new(0.0, bpm));
            }
            None => self.events.push(TempoEvent::new(0.0, DEFAULT_BPM)),
        }
    }

    /// All events, sorted by beat
    pub fn events(&self) -> &[TempoEvent] {
        &self.events
    }

    /// Index of the event in effect at `beat`
    #[inline]
    fn segment_index(&self, beat: f64) -> usize {
        self.events
            .partition_point(|e| e.beat <= beat)
            .saturating_sub(1)
    }

    /// Instantaneous tempo at `beat`
    #[inline]
    pub fn tempo_at(&self, beat: f64) -> f64 {
        self.events[self.segment_index(beat)].bpm
    }

    /// Absolute time in seconds of `beat`
    pub fn seconds_at(&self, beat: f64) -> f64 {
        if beat <= 0.0 {
            return beat * 60.0 / self.events[0].bpm;
        }
        let mut seconds = 0.0;
        for (i, event) in self.events.iter().enumerate() {
            let segment_end = self
                .events
                .get(i + 1)
                .map(|next| next.beat)
                .unwrap_or(f64::INFINITY);
            if beat <= segment_end {
                return seconds + (beat - event.beat) * 60.0 / event.bpm;
            }
            seconds += (segment_end - event.beat) * 60.0 / event.bpm;
        }
        seconds
    }

    /// Beat position reached after `seconds` of playback from beat 0
    pub fn beat_at_seconds(&self, seconds: f64) -> f64 {
        if seconds <= 0.0 {
            return seconds * self.events[0].bpm / 60.0;
        }
        let mut elapsed = 0.0;
        for (i, event) in self.events.iter().enumerate() {
            let Some(next) = self.events.get(i + 1) else {
                return event.beat + (seconds - elapsed) * event.bpm / 60.0;
            };
            let segment_secs = (next.beat - event.beat) * 60.0 / event.bpm;
            if seconds <= elapsed + segment_secs {
                return event.beat + (seconds - elapsed) * event.bpm / 60.0;
            }
            elapsed += segment_secs;
        }
        0.0
    }

    /// Absolute sample position of `beat`
    #[inline]
    pub fn samples_at(&self, beat: f64, sample_rate: f64) -> f64 {
        self.seconds_at(beat) * sample_rate
    }

    /// Beat position of an absolute sample offset
    #[inline]
    pub fn beat_at_sample(&self, sample: f64, sample_rate: f64) -> f64 {
        self.beat_at_seconds(sample / sample_rate)
    }

    /// Beats advanced by one sample at `beat`
    #[inline]
    pub fn beats_per_sample(&self, beat: f64, sample_rate: f64) -> f64 {
        self.tempo_at(beat) / (60.0 * sample_rate)
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(DEFAULT_BPM)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tempo_change_boundary() {
        let map = TempoMap::from_events([TempoEvent::new(0.0, 120.0), TempoEvent::new(8.0, 140.0)]);
        assert_eq!(map.tempo_at(8.0), 140.0);
        assert_eq!(map.tempo_at(7.999), 120.0);
        assert_eq!(map.tempo_at(-1.0), 120.0);
        assert_eq!(map.tempo_at(1000.0), 140.0);
    }

    #[test]
    fn test_origin_always_present() {
        let map = TempoMap::from_events([TempoEvent::new(4.0, 90.0)]);
        assert_eq!(map.events()[0].beat, 0.0);
        assert_eq!(map.events()[0].bpm, 90.0);

        let empty = TempoMap::from_events([]);
        assert_eq!(empty.events().len(), 1);
        assert_eq!(empty.tempo_at(0.0), DEFAULT_BPM);

        let mut map = TempoMap::new(100.0);
        assert!(!map.remove(0.0));
        assert_eq!(map.events().len(), 1);
    }

    #[test]
    fn test_bpm_clamped() {
        let map = TempoMap::new(0.0);
        assert_eq!(map.tempo_at(0.0), MIN_BPM);
    }

    #[test]
    fn test_seconds_integration() {
        let map = TempoMap::from_events([TempoEvent::new(0.0, 120.0), TempoEvent::new(8.0, 60.0)]);
        // 8 beats at 120 = 4s, then 2 beats at 60 = 2s
        assert_relative_eq!(map.seconds_at(8.0), 4.0, epsilon = 1e-12);
        assert_relative_eq!(map.seconds_at(10.0), 6.0, epsilon = 1e-12);
        assert_relative_eq!(map.beat_at_seconds(6.0), 10.0, epsilon = 1e-12);
        assert_relative_eq!(map.beat_at_seconds(2.0), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_samples_roundtrip() {
        let map = TempoMap::from_events([TempoEvent::new(0.0, 97.0), TempoEvent::new(3.5, 133.0)]);
        for beat in [0.0, 1.25, 3.5, 7.75, 20.0] {
            let samples = map.samples_at(beat, 48_000.0);
            assert_relative_eq!(map.beat_at_sample(samples, 48_000.0), beat, epsilon = 1e-9);
        }
    }
}
