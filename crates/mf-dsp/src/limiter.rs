//! Master Peak Limiter
//!
//! Stereo-linked feed-forward peak limiter:
//! - Peak detection on the larger of the direct sample and the midpoint
//!   between consecutive samples (cheap intersample estimate)
//! - Asymmetric envelope: fast attack, slow release
//! - Hard clamp to the ceiling after gain is applied, so the output never
//!   exceeds the ceiling even during the attack phase

use mf_core::Sample;

use crate::{Processor, ProcessorConfig, StereoProcessor};

/// Default ceiling (-0.3 dBFS)
pub const DEFAULT_CEILING: f64 = 0.966_051;

/// Attack time constant in seconds
const ATTACK_SECS: f64 = 0.0005;

/// Release time constant in seconds
const RELEASE_SECS: f64 = 0.1;

/// Stereo-linked peak limiter
#[derive(Debug, Clone)]
pub struct PeakLimiter {
    ceiling: f64,
    gain: f64,
    attack_coeff: f64,
    release_coeff: f64,
    prev_l: Sample,
    prev_r: Sample,
}

impl PeakLimiter {
    pub fn new(ceiling: f64, sample_rate: f64) -> Self {
        let mut limiter = Self {
            ceiling: ceiling.clamp(0.01, 1.0),
            gain: 1.0,
            attack_coeff: 0.0,
            release_coeff: 0.0,
            prev_l: 0.0,
            prev_r: 0.0,
        };
        limiter.set_sample_rate(sample_rate);
        limiter
    }

    #[inline]
    fn coeff(secs: f64, sample_rate: f64) -> f64 {
        (-1.0 / (secs * sample_rate).max(1.0)).exp()
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn set_ceiling(&mut self, ceiling: f64) {
        self.ceiling = ceiling.clamp(0.01, 1.0);
    }

    /// Current gain reduction as a linear factor (1.0 = none)
    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl Processor for PeakLimiter {
    fn reset(&mut self) {
        self.gain = 1.0;
        self.prev_l = 0.0;
        self.prev_r = 0.0;
    }
}

impl ProcessorConfig for PeakLimiter {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.attack_coeff = Self::coeff(ATTACK_SECS, sample_rate);
        self.release_coeff = Self::coeff(RELEASE_SECS, sample_rate);
    }
}

impl StereoProcessor for PeakLimiter {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        let mid_l = 0.5 * (self.prev_l + left);
        let mid_r = 0.5 * (self.prev_r + right);
        self.prev_l = left;
        self.prev_r = right;

        let peak = left
            .abs()
            .max(right.abs())
            .max(mid_l.abs())
            .max(mid_r.abs());

        let target = if peak > self.ceiling { self.ceiling / peak } else { 1.0 };

        let coeff = if target < self.gain {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.gain = target + (self.gain - target) * coeff;

        let c = self.ceiling;
        (
            (left * self.gain).clamp(-c, c),
            (right * self.gain).clamp(-c, c),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_never_exceeds_ceiling() {
        let mut lim = PeakLimiter::new(DEFAULT_CEILING, 48_000.0);
        for i in 0..4800 {
            let x = (i as f64 * 0.05).sin() * 8.0;
            let (l, r) = lim.process_sample(x, -x);
            assert!(l.abs() <= DEFAULT_CEILING + 1e-12);
            assert!(r.abs() <= DEFAULT_CEILING + 1e-12);
        }
        assert!(lim.gain() < 1.0);
    }

    #[test]
    fn test_transparent_below_ceiling() {
        let mut lim = PeakLimiter::new(DEFAULT_CEILING, 48_000.0);
        let (l, r) = lim.process_sample(0.25, -0.5);
        assert_eq!((l, r), (0.25, -0.5));
    }

    #[test]
    fn test_release_recovers() {
        let mut lim = PeakLimiter::new(0.5, 48_000.0);
        for _ in 0..100 {
            lim.process_sample(2.0, 2.0);
        }
        let reduced = lim.gain();
        for _ in 0..48_000 {
            lim.process_sample(0.0, 0.0);
        }
        assert!(lim.gain() > reduced);
        assert!(lim.gain() > 0.99);
    }
}
