//! Aux / return buses
//!
//! Each bus accumulates track sends (and tracks routed to it) into its own
//! stereo input, runs its effect, applies the return gain and, in
//! reduced-feedback mode, a safety saturator. The return is then summed
//! into the main mix.

use mf_core::Sample;
use mf_dsp::reverb::AlgorithmicReverb;
use mf_dsp::saturation::Saturator;
use mf_dsp::{Processor, ProcessorConfig, StereoProcessor};

use crate::control::AuxBusSettings;

/// Saturator drive on returns in reduced-feedback mode
const SAFETY_DRIVE: f64 = 1.5;

/// Saturator ceiling on returns in reduced-feedback mode
const SAFETY_CEILING: f64 = 0.8;

/// Single return bus with an algorithmic reverb
pub struct AuxBus {
    index: usize,
    input_l: Vec<Sample>,
    input_r: Vec<Sample>,
    reverb: AlgorithmicReverb,
    saturator: Saturator,
    /// Inputs were written since the last clear
    active: bool,
}

impl AuxBus {
    pub fn new(index: usize, max_block: usize, sample_rate: f64) -> Self {
        Self {
            index,
            input_l: vec![0.0; max_block],
            input_r: vec![0.0; max_block],
            reverb: AlgorithmicReverb::new(sample_rate),
            saturator: Saturator::new(SAFETY_DRIVE, SAFETY_CEILING),
            active: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Latency of the bus effect in samples
    pub fn latency(&self) -> usize {
        self.reverb.latency()
    }

    pub fn clear(&mut self, n: usize) {
        let n = n.min(self.input_l.len());
        self.input_l[..n].fill(0.0);
        self.input_r[..n].fill(0.0);
        self.active = false;
    }

    /// Accumulate a stereo signal into the bus input
    #[inline]
    pub fn add(&mut self, left: &[Sample], right: &[Sample], n: usize) {
        let n = n.min(self.input_l.len()).min(left.len()).min(right.len());
        for (dst, src) in self.input_l[..n].iter_mut().zip(&left[..n]) {
            *dst += src;
        }
        for (dst, src) in self.input_r[..n].iter_mut().zip(&right[..n]) {
            *dst += src;
        }
        self.active = true;
    }

    /// Run the bus and leave the return signal in the input buffers.
    ///
    /// The effect runs only when the bus is enabled, the return level is
    /// non-zero and `effects_allowed` (false during overload recovery). A
    /// disabled or muted bus returns silence.
    pub fn process(&mut self, settings: &AuxBusSettings, effects_allowed: bool, reduced_feedback: bool, n: usize) {
        let n = n.min(self.input_l.len());
        let (left, right) = (&mut self.input_l[..n], &mut self.input_r[..n]);

        if !settings.enabled || settings.return_level <= 0.0 {
            left.fill(0.0);
            right.fill(0.0);
            return;
        }

        if effects_allowed {
            if (self.reverb.room_size() - settings.room_size).abs() > f64::EPSILON {
                self.reverb.set_room_size(settings.room_size);
            }
            self.reverb.set_damping(settings.damping);
            self.reverb.process_block(left, right);
        }

        let gain = settings.return_level;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            *l *= gain;
            *r *= gain;
        }

        if reduced_feedback {
            StereoProcessor::process_block(&mut self.saturator, left, right);
        }
    }

    /// Return signal after [`AuxBus::process`]
    pub fn output(&self, n: usize) -> (&[Sample], &[Sample]) {
        let n = n.min(self.input_l.len());
        (&self.input_l[..n], &self.input_r[..n])
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reset(&mut self) {
        self.input_l.fill(0.0);
        self.input_r.fill(0.0);
        self.reverb.reset();
        self.active = false;
    }

    /// Reallocate for a new device configuration
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.input_l = vec![0.0; max_block];
        self.input_r = vec![0.0; max_block];
        self.reverb.set_sample_rate(sample_rate);
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_bus() -> AuxBus {
        let mut bus = AuxBus::new(0, 512, 48_000.0);
        bus.clear(512);
        let mut l = vec![0.0; 512];
        l[0] = 1.0;
        bus.add(&l, &l, 512);
        bus
    }

    #[test]
    fn test_disabled_bus_is_silent() {
        let mut bus = impulse_bus();
        let settings = AuxBusSettings {
            enabled: false,
            ..Default::default()
        };
        bus.process(&settings, true, false, 512);
        assert!(bus.output(512).0.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_zero_return_is_silent() {
        let mut bus = impulse_bus();
        let settings = AuxBusSettings {
            return_level: 0.0,
            ..Default::default()
        };
        bus.process(&settings, true, false, 512);
        assert!(bus.output(512).1.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_effects_bypassed_in_recovery() {
        let mut bus = impulse_bus();
        let settings = AuxBusSettings {
            return_level: 0.5,
            ..Default::default()
        };
        bus.process(&settings, false, false, 512);
        let (l, _) = bus.output(512);
        // Dry pass-through scaled by the return gain
        assert_eq!(l[0], 0.5);
        assert!(l[1..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_reverb_produces_tail() {
        let mut bus = AuxBus::new(0, 4096, 48_000.0);
        bus.clear(4096);
        let mut l = vec![0.0; 4096];
        l[0] = 1.0;
        bus.add(&l, &l, 4096);
        bus.process(&AuxBusSettings::default(), true, false, 4096);
        // Comb delays put the first reflections past the first block of 512
        assert!(bus.output(4096).0.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_reduced_feedback_bounds_return() {
        let mut bus = AuxBus::new(0, 64, 48_000.0);
        bus.clear(64);
        let hot = vec![10.0; 64];
        bus.add(&hot, &hot, 64);
        let settings = AuxBusSettings {
            return_level: 2.0,
            ..Default::default()
        };
        bus.process(&settings, false, true, 64);
        assert!(bus.output(64).0.iter().all(|s| s.abs() <= SAFETY_CEILING));
    }
}
