//! Versioned control block
//!
//! Every runtime switch the audio thread reads (master gain, chain enables,
//! safety modes, loop region, aux bus settings) lives in one immutable
//! [`ControlBlock`]. The control thread publishes a modified copy; the audio
//! thread performs one lock-free load per block. Superseded blocks are
//! parked in a retirement list so the audio thread never frees one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use arc_swap::Guard;
use mf_dsp::signal_integrity::DEFAULT_DITHER_BITS;
use serde::{Deserialize, Serialize};

use crate::snapshot::RetirementList;

// ═══════════════════════════════════════════════════════════════════════════════
// AUX BUS SETTINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-bus return settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuxBusSettings {
    pub enabled: bool,
    /// Linear return gain
    pub return_level: f64,
    /// Reverb room size 0..1
    pub room_size: f64,
    /// Reverb damping 0..1
    pub damping: f64,
}

impl Default for AuxBusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            return_level: 1.0,
            room_size: 0.6,
            damping: 0.4,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROL BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable runtime settings, read once per block by the audio thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBlock {
    /// Monotonic publication counter
    pub version: u64,
    /// Master output gain (linear)
    pub master_gain: f64,
    pub soft_clip: bool,
    pub limiter: bool,
    pub dc_block: bool,
    pub dither: bool,
    pub dither_bits: u32,
    pub metronome: bool,
    /// Metronome click level (linear)
    pub metronome_level: f64,
    /// Conservative monitoring: tracks attenuate live input paths
    pub monitor_safe: bool,
    /// Aux returns pass through a safety saturator
    pub reduced_feedback: bool,
    /// Allow worker-pool dispatch
    pub parallel: bool,
    /// Route live input to monitoring tracks
    pub input_monitoring: bool,
    pub loop_enabled: bool,
    pub loop_start: f64,
    pub loop_end: f64,
    pub aux: Vec<AuxBusSettings>,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self {
            version: 0,
            master_gain: 1.0,
            soft_clip: true,
            limiter: true,
            dc_block: true,
            dither: false,
            dither_bits: DEFAULT_DITHER_BITS,
            metronome: false,
            metronome_level: 0.5,
            monitor_safe: false,
            reduced_feedback: false,
            parallel: true,
            input_monitoring: true,
            loop_enabled: false,
            loop_start: 0.0,
            loop_end: 4.0,
            aux: Vec::new(),
        }
    }
}

impl ControlBlock {
    /// Default block with `aux_count` default aux buses
    pub fn with_aux_buses(aux_count: usize) -> Self {
        Self {
            aux: vec![AuxBusSettings::default(); aux_count],
            ..Self::default()
        }
    }

    /// Loop region if enabled and non-degenerate
    pub fn loop_region(&self) -> Option<(f64, f64)> {
        (self.loop_enabled && self.loop_end > self.loop_start && self.loop_start >= 0.0)
            .then_some((self.loop_start, self.loop_end))
    }

    pub fn aux_settings(&self, bus: usize) -> AuxBusSettings {
        self.aux.get(bus).copied().unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROL SLOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Single atomic slot holding the current control block
pub struct ControlSlot {
    current: ArcSwap<ControlBlock>,
    version: AtomicU64,
    retired: RetirementList<ControlBlock>,
}

impl ControlSlot {
    pub fn new(initial: ControlBlock) -> Self {
        let version = initial.version;
        Self {
            current: ArcSwap::from_pointee(initial),
            version: AtomicU64::new(version),
            retired: RetirementList::new(),
        }
    }

    /// Lock-free load (audio thread)
    #[inline]
    pub fn load(&self) -> Guard<Arc<ControlBlock>> {
        self.current.load()
    }

    /// Owned copy of the current block (control thread)
    pub fn get(&self) -> ControlBlock {
        ControlBlock::clone(&self.current.load())
    }

    /// Publish a modified copy of the current block. Returns the new version.
    pub fn update(&self, f: impl FnOnce(&mut ControlBlock)) -> u64 {
        let mut next = self.get();
        f(&mut next);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        next.version = version;
        let previous = self.current.swap(Arc::new(next));
        self.retired.retire(previous);
        version
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Free retired blocks no reader holds any more. Returns how many were freed.
    pub fn drain_retired(&self) -> usize {
        self.retired.drain()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }
}

impl Default for ControlSlot {
    fn default() -> Self {
        Self::new(ControlBlock::default())
    }
}
