//! Safety envelope
//!
//! - Startup / fault mute window: whole blocks of silence
//! - Release ramp: linear fade-in once the mute window has elapsed
//! - Severe fault scrub: non-finite or grossly out-of-range samples are
//!   zeroed and re-arm the mute window
//! - Overload detection: a callback exceeding a fraction of its time budget
//!   opens a recovery window (no parallel dispatch, no aux effects)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mf_core::Sample;

use crate::config::EngineConfig;

/// Audio-thread safety state
#[derive(Debug)]
pub struct SafetyEnvelope {
    mute_window: u32,
    mute_remaining: u32,
    ramp_len: usize,
    /// Position in the release ramp; `ramp_len` when no ramp is running
    ramp_pos: usize,
    recovery_window: u32,
    recovery_remaining: u32,
    overload_fraction: f64,
    fault_amplitude: f64,
    /// Set by the control thread to re-arm the mute window
    rearm: Arc<AtomicBool>,
}

impl SafetyEnvelope {
    pub fn new(config: &EngineConfig) -> Self {
        let mut envelope = Self {
            mute_window: config.startup_mute_blocks,
            mute_remaining: 0,
            ramp_len: config.startup_ramp_samples,
            ramp_pos: config.startup_ramp_samples,
            recovery_window: config.overload_recovery_blocks,
            recovery_remaining: 0,
            overload_fraction: config.overload_fraction,
            fault_amplitude: config.severe_fault_amplitude,
            rearm: Arc::new(AtomicBool::new(false)),
        };
        envelope.arm();
        envelope
    }

    /// Handle the control thread uses to request a fresh mute + ramp
    pub fn rearm_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.rearm)
    }

    /// Start a mute window followed by a release ramp
    pub fn arm(&mut self) {
        self.mute_remaining = self.mute_window;
        self.ramp_pos = 0;
    }

    /// Called once per block before any processing. Returns true when the
    /// block must be silent; the caller clears the output and returns.
    #[inline]
    pub fn begin_block(&mut self) -> bool {
        if self.rearm.swap(false, Ordering::AcqRel) {
            self.arm();
        }
        if self.mute_remaining > 0 {
            self.mute_remaining -= 1;
            return true;
        }
        false
    }

    pub fn is_muted(&self) -> bool {
        self.mute_remaining > 0
    }

    pub fn is_ramping(&self) -> bool {
        self.ramp_pos < self.ramp_len
    }

    /// Apply the release ramp to a stereo block
    #[inline]
    pub fn apply_ramp(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        if !self.is_ramping() {
            return;
        }
        let len = self.ramp_len as f64;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            if self.ramp_pos >= self.ramp_len {
                break;
            }
            let gain = self.ramp_pos as f64 / len;
            *l *= gain;
            *r *= gain;
            self.ramp_pos += 1;
        }
    }

    /// Zero every non-finite or out-of-range sample. Returns how many were
    /// scrubbed; any count above zero re-arms the mute window.
    #[inline]
    pub fn scrub(&mut self, left: &mut [Sample], right: &mut [Sample]) -> usize {
        let limit = self.fault_amplitude;
        let mut faults = 0;
        for s in left.iter_mut().chain(right.iter_mut()) {
            if !s.is_finite() || s.abs() > limit {
                *s = 0.0;
                faults += 1;
            }
        }
        if faults > 0 {
            self.arm();
        }
        faults
    }

    /// Check the callback duration against the block budget. Returns true
    /// when this block opened (or extended) an overload recovery window.
    pub fn check_overload(&mut self, elapsed: Duration, budget: Duration) -> bool {
        if budget.is_zero() {
            return false;
        }
        if elapsed.as_secs_f64() > budget.as_secs_f64() * self.overload_fraction {
            self.recovery_remaining = self.recovery_window;
            return true;
        }
        false
    }

    /// Low-latency / recovery state: parallel dispatch and aux effects off
    pub fn in_recovery(&self) -> bool {
        self.recovery_remaining > 0
    }

    /// Called once at the end of every processed block
    pub fn end_block(&mut self) {
        self.recovery_remaining = self.recovery_remaining.saturating_sub(1);
    }

    /// Reconfigure from a new config and re-arm
    pub fn reconfigure(&mut self, config: &EngineConfig) {
        self.mute_window = config.startup_mute_blocks;
        self.ramp_len = config.startup_ramp_samples;
        self.recovery_window = config.overload_recovery_blocks;
        self.recovery_remaining = 0;
        self.overload_fraction = config.overload_fraction;
        self.fault_amplitude = config.severe_fault_amplitude;
        self.arm();
    }
}
