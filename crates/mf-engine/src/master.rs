//! Master bus chain
//!
//! Per sample, in order:
//! 1. Gain dezippering toward the current master gain
//! 2. 2x-oversampled soft clip (optional)
//! 3. Peak limiter (optional)
//! 4. DC blocker (optional)
//! 5. TPDF dither (optional)
//! 6. Non-finite scrub and hard clamp to the ceiling
//!
//! Step 6 always runs, so the output is finite and inside
//! `[-ceiling, ceiling]` for any input.

use mf_core::{Sample, sanitize};
use mf_dsp::limiter::PeakLimiter;
use mf_dsp::signal_integrity::{Dither, StereoDcBlocker};
use mf_dsp::smoothing::{DEFAULT_TIME_CONSTANT, GainSmoother};
use mf_dsp::soft_clip::{DEFAULT_DRIVE, StereoSoftClipper};
use mf_dsp::{Processor, ProcessorConfig, StereoProcessor};

use crate::control::ControlBlock;

/// Stage switches for one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterSettings {
    pub gain: f64,
    pub soft_clip: bool,
    pub limiter: bool,
    pub dc_block: bool,
    pub dither: bool,
    pub dither_bits: u32,
}

impl MasterSettings {
    /// Settings from the control block, with an optional automated gain override
    pub fn from_control(control: &ControlBlock, automated_gain: Option<f64>) -> Self {
        Self {
            gain: automated_gain.unwrap_or(control.master_gain),
            soft_clip: control.soft_clip,
            limiter: control.limiter,
            dc_block: control.dc_block,
            dither: control.dither,
            dither_bits: control.dither_bits,
        }
    }
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self::from_control(&ControlBlock::default(), None)
    }
}

/// Master signal chain
pub struct MasterChain {
    gain: GainSmoother,
    clipper: StereoSoftClipper,
    limiter: PeakLimiter,
    dc: StereoDcBlocker,
    dither: Dither,
    ceiling: f64,
}

impl MasterChain {
    pub fn new(sample_rate: f64, ceiling: f64) -> Self {
        let ceiling = ceiling.clamp(0.01, 1.0);
        Self {
            gain: GainSmoother::new(1.0, DEFAULT_TIME_CONSTANT, sample_rate),
            clipper: StereoSoftClipper::new(DEFAULT_DRIVE),
            limiter: PeakLimiter::new(ceiling, sample_rate),
            dc: StereoDcBlocker::new(sample_rate),
            dither: Dither::default(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn current_gain(&self) -> f64 {
        self.gain.current()
    }

    /// Process one stereo block in place
    pub fn process(&mut self, left: &mut [Sample], right: &mut [Sample], settings: &MasterSettings) {
        self.gain.set_target(settings.gain.max(0.0));
        if settings.dither && self.dither.target_bits() != settings.dither_bits.clamp(8, 32) {
            self.dither = Dither::new(settings.dither_bits);
        }

        let ceiling = self.ceiling;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let g = self.gain.next();
            // Scrub first so no stage ever sees a non-finite value
            let mut sl = sanitize(*l * g, Sample::MAX);
            let mut sr = sanitize(*r * g, Sample::MAX);

            if settings.soft_clip {
                (sl, sr) = self.clipper.process_sample(sl, sr);
            }
            if settings.limiter {
                (sl, sr) = self.limiter.process_sample(sl, sr);
            }
            if settings.dc_block {
                (sl, sr) = self.dc.process_sample(sl, sr);
            }
            if settings.dither {
                (sl, sr) = self.dither.process_sample(sl, sr);
            }

            *l = sanitize(sl, ceiling);
            *r = sanitize(sr, ceiling);
        }
    }

    pub fn reset(&mut self) {
        self.gain.snap();
        self.clipper.reset();
        self.limiter.reset();
        self.dc.reset();
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.gain.set_sample_rate(sample_rate);
        self.limiter.set_sample_rate(sample_rate);
        self.dc.set_sample_rate(sample_rate);
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> MasterSettings {
        MasterSettings {
            gain: 1.0,
            soft_clip: true,
            limiter: true,
            dc_block: true,
            dither: true,
            dither_bits: 16,
        }
    }

    #[test]
    fn test_bounded_for_hot_input() {
        let mut chain = MasterChain::new(48_000.0, 0.9);
        let mut l: Vec<f64> = (0..4096).map(|i| (i as f64 * 0.1).sin() * 50.0).collect();
        let mut r = l.clone();
        chain.process(&mut l, &mut r, &all_on());
        assert!(l.iter().chain(&r).all(|s| s.is_finite() && s.abs() <= 0.9));
    }

    #[test]
    fn test_bounded_with_every_stage_off() {
        let mut chain = MasterChain::new(48_000.0, 0.5);
        let settings = MasterSettings {
            gain: 10.0,
            soft_clip: false,
            limiter: false,
            dc_block: false,
            dither: false,
            dither_bits: 24,
        };
        let mut l = vec![1e300, f64::NAN, f64::INFINITY, -3.0];
        let mut r = vec![f64::NEG_INFINITY, 0.1, -1e300, 3.0];
        chain.process(&mut l, &mut r, &settings);
        assert!(l.iter().chain(&r).all(|s| s.is_finite() && s.abs() <= 0.5));
        assert_eq!(l[1], 0.0);
    }

    #[test]
    fn test_gain_is_dezippered() {
        let mut chain = MasterChain::new(48_000.0, 1.0);
        let settings = MasterSettings {
            gain: 0.0,
            soft_clip: false,
            limiter: false,
            dc_block: false,
            dither: false,
            dither_bits: 24,
        };
        let mut l = vec![0.5; 64];
        let mut r = vec![0.5; 64];
        chain.process(&mut l, &mut r, &settings);
        // First sample barely moved, then monotonic decay
        assert!(l[0] > 0.49);
        assert!(l.windows(2).all(|w| w[1] <= w[0]));
        assert!(chain.current_gain() < 1.0);
    }

    #[test]
    fn test_settings_from_control() {
        let control = ControlBlock {
            master_gain: 0.3,
            dither: true,
            ..Default::default()
        };
        assert_eq!(MasterSettings::from_control(&control, None).gain, 0.3);
        assert_eq!(MasterSettings::from_control(&control, Some(0.8)).gain, 0.8);
        assert!(MasterSettings::from_control(&control, None).dither);
    }
}
