//! Engine telemetry
//!
//! Lock-free counters and meters written by the audio thread and read by
//! anything else. The audio thread never logs; housekeeping turns counter
//! changes into log lines.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use mf_dsp::analysis::{BlockStats, LOUDNESS_FLOOR};
use portable_atomic::AtomicF64;
use serde::Serialize;

/// Event counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Callback overran its time budget
    Xrun,
    /// Overload recovery windows entered
    Overload,
    /// Blocks silenced by the guard (bad parameters, missing capacity)
    GuardDrop,
    /// Automation captures lost to a full write-back queue
    DroppedAutomation,
    /// Blocks where PDC was skipped for lack of ring capacity
    PdcSkip,
    /// Non-finite or out-of-range output samples scrubbed
    SevereFault,
    /// MIDI events lost to full per-track buffers
    MidiOverflow,
    /// Blocks skipped because the callback lock was held elsewhere
    LockContention,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::Xrun,
        Counter::Overload,
        Counter::GuardDrop,
        Counter::DroppedAutomation,
        Counter::PdcSkip,
        Counter::SevereFault,
        Counter::MidiOverflow,
        Counter::LockContention,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Log prefix used by housekeeping
    pub fn tag(self) -> &'static str {
        match self {
            Counter::Xrun | Counter::Overload | Counter::LockContention => "[XRUN]",
            Counter::PdcSkip => "[PDC]",
            Counter::GuardDrop | Counter::SevereFault => "[SAFETY]",
            Counter::DroppedAutomation => "[AUTOMATION]",
            Counter::MidiOverflow => "[MIDI]",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::Xrun => "xruns",
            Counter::Overload => "overloads",
            Counter::GuardDrop => "guard drops",
            Counter::DroppedAutomation => "dropped automation writes",
            Counter::PdcSkip => "pdc skips",
            Counter::SevereFault => "severe faults",
            Counter::MidiOverflow => "midi overflows",
            Counter::LockContention => "lock contentions",
        }
    }
}

/// Shared engine telemetry
pub struct Telemetry {
    counters: [AtomicU64; Counter::ALL.len()],
    blocks: AtomicU64,

    // Master meters (last block)
    peak_l: AtomicF64,
    peak_r: AtomicF64,
    rms_l: AtomicF64,
    rms_r: AtomicF64,
    correlation: AtomicF64,
    loudness: AtomicF64,

    input_peak: AtomicF64,
    input_rms: AtomicF64,

    /// Callback time / block time budget
    load: AtomicF64,
    /// Graph latency of the last block, in samples
    graph_latency: AtomicU64,
    /// Blocks left to show the clip indicator
    clip_hold: AtomicU32,

    track_peaks: Vec<AtomicF64>,
}

impl Telemetry {
    pub fn new(max_tracks: usize) -> Self {
        Self {
            counters: Default::default(),
            blocks: AtomicU64::new(0),
            peak_l: AtomicF64::new(0.0),
            peak_r: AtomicF64::new(0.0),
            rms_l: AtomicF64::new(0.0),
            rms_r: AtomicF64::new(0.0),
            correlation: AtomicF64::new(0.0),
            loudness: AtomicF64::new(LOUDNESS_FLOOR),
            input_peak: AtomicF64::new(0.0),
            input_rms: AtomicF64::new(0.0),
            load: AtomicF64::new(0.0),
            graph_latency: AtomicU64::new(0),
            clip_hold: AtomicU32::new(0),
            track_peaks: (0..max_tracks).map(|_| AtomicF64::new(0.0)).collect(),
        }
    }

    // ─── counters ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: Counter, amount: u64) {
        if amount > 0 {
            self.counters[counter.index()].fetch_add(amount, Ordering::Relaxed);
        }
    }

    /// Overwrite a counter mirrored from another source (e.g. a queue's own drop count)
    #[inline]
    pub(crate) fn mirror(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].fetch_max(value, Ordering::Relaxed);
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn block_done(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    // ─── meters ───────────────────────────────────────────────────────────────

    /// Publish master meters and update clip hold
    #[inline]
    pub(crate) fn set_master(&self, stats: &BlockStats, clip_threshold: f64, hold_blocks: u32) {
        self.peak_l.store(stats.peak_l, Ordering::Relaxed);
        self.peak_r.store(stats.peak_r, Ordering::Relaxed);
        self.rms_l.store(stats.rms_l, Ordering::Relaxed);
        self.rms_r.store(stats.rms_r, Ordering::Relaxed);
        self.correlation.store(stats.correlation, Ordering::Relaxed);
        self.loudness.store(stats.loudness, Ordering::Relaxed);

        if stats.peak() >= clip_threshold {
            self.clip_hold.store(hold_blocks, Ordering::Relaxed);
        } else {
            let held = self.clip_hold.load(Ordering::Relaxed);
            if held > 0 {
                self.clip_hold.store(held - 1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub(crate) fn set_input(&self, peak: f64, rms: f64) {
        self.input_peak.store(peak, Ordering::Relaxed);
        self.input_rms.store(rms, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_load(&self, load: f64) {
        self.load.store(load, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_graph_latency(&self, samples: usize) {
        self.graph_latency.store(samples as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_track_peak(&self, track: usize, peak: f64) {
        if let Some(slot) = self.track_peaks.get(track) {
            slot.store(peak, Ordering::Relaxed);
        }
    }

    pub fn track_peak(&self, track: usize) -> f64 {
        self.track_peaks.get(track).map_or(0.0, |p| p.load(Ordering::Relaxed))
    }

    pub fn clip_hold(&self) -> bool {
        self.clip_hold.load(Ordering::Relaxed) > 0
    }

    pub fn graph_latency(&self) -> usize {
        self.graph_latency.load(Ordering::Relaxed) as usize
    }

    /// Consistent-enough copy of everything for display and logging
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            blocks: self.blocks(),
            xruns: self.counter(Counter::Xrun),
            overloads: self.counter(Counter::Overload),
            guard_drops: self.counter(Counter::GuardDrop),
            dropped_automation: self.counter(Counter::DroppedAutomation),
            pdc_skips: self.counter(Counter::PdcSkip),
            severe_faults: self.counter(Counter::SevereFault),
            midi_overflows: self.counter(Counter::MidiOverflow),
            lock_contentions: self.counter(Counter::LockContention),
            peak_l: self.peak_l.load(Ordering::Relaxed),
            peak_r: self.peak_r.load(Ordering::Relaxed),
            rms_l: self.rms_l.load(Ordering::Relaxed),
            rms_r: self.rms_r.load(Ordering::Relaxed),
            correlation: self.correlation.load(Ordering::Relaxed),
            loudness: self.loudness.load(Ordering::Relaxed),
            input_peak: self.input_peak.load(Ordering::Relaxed),
            input_rms: self.input_rms.load(Ordering::Relaxed),
            load: self.load.load(Ordering::Relaxed),
            graph_latency: self.graph_latency(),
            clip: self.clip_hold(),
        }
    }
}

/// Plain copy of [`Telemetry`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub blocks: u64,
    pub xruns: u64,
    pub overloads: u64,
    pub guard_drops: u64,
    pub dropped_automation: u64,
    pub pdc_skips: u64,
    pub severe_faults: u64,
    pub midi_overflows: u64,
    pub lock_contentions: u64,
    pub peak_l: f64,
    pub peak_r: f64,
    pub rms_l: f64,
    pub rms_r: f64,
    pub correlation: f64,
    pub loudness: f64,
    pub input_peak: f64,
    pub input_rms: f64,
    pub load: f64,
    pub graph_latency: usize,
    pub clip: bool,
}

impl TelemetrySnapshot {
    pub fn counter(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Xrun => self.xruns,
            Counter::Overload => self.overloads,
            Counter::GuardDrop => self.guard_drops,
            Counter::DroppedAutomation => self.dropped_automation,
            Counter::PdcSkip => self.pdc_skips,
            Counter::SevereFault => self.severe_faults,
            Counter::MidiOverflow => self.midi_overflows,
            Counter::LockContention => self.lock_contentions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let t = Telemetry::new(4);
        t.increment(Counter::Xrun);
        t.add(Counter::PdcSkip, 3);
        t.mirror(Counter::DroppedAutomation, 7);
        t.mirror(Counter::DroppedAutomation, 5);

        let snap = t.snapshot();
        assert_eq!(snap.xruns, 1);
        assert_eq!(snap.pdc_skips, 3);
        assert_eq!(snap.counter(Counter::DroppedAutomation), 7);
    }

    #[test]
    fn test_clip_hold_counts_down() {
        let t = Telemetry::new(0);
        let hot = BlockStats {
            peak_l: 1.0,
            ..Default::default()
        };
        let quiet = BlockStats::default();

        t.set_master(&hot, 0.99, 2);
        assert!(t.clip_hold());
        t.set_master(&quiet, 0.99, 2);
        assert!(t.clip_hold());
        t.set_master(&quiet, 0.99, 2);
        assert!(!t.clip_hold());
    }

    #[test]
    fn test_track_peaks_bounded() {
        let t = Telemetry::new(2);
        t.set_track_peak(1, 0.5);
        t.set_track_peak(9, 0.5);
        assert_eq!(t.track_peak(1), 0.5);
        assert_eq!(t.track_peak(9), 0.0);
    }
}
