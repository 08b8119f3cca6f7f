//! Gain Dezippering
//!
//! One-pole exponential smoothing toward a target value. The coefficient is
//! derived from a fixed time constant and the sample rate, so a step change of
//! the target reaches ~63% after `time_constant` seconds regardless of rate.

use mf_core::Sample;

use crate::ProcessorConfig;

/// Default master gain time constant (20 ms)
pub const DEFAULT_TIME_CONSTANT: f64 = 0.02;

/// Exponentially smoothed gain value
#[derive(Debug, Clone)]
pub struct GainSmoother {
    current: f64,
    target: f64,
    coeff: f64,
    time_constant: f64,
}

impl GainSmoother {
    pub fn new(initial: f64, time_constant: f64, sample_rate: f64) -> Self {
        let mut smoother = Self {
            current: initial,
            target: initial,
            coeff: 1.0,
            time_constant,
        };
        smoother.set_sample_rate(sample_rate);
        smoother
    }

    fn calculate_coeff(time_constant: f64, sample_rate: f64) -> f64 {
        let samples = time_constant * sample_rate;
        if samples <= 0.0 || !samples.is_finite() {
            1.0
        } else {
            1.0 - (-1.0 / samples).exp()
        }
    }

    #[inline]
    pub fn set_target(&mut self, target: f64) {
        if target.is_finite() {
            self.target = target;
        }
    }

    #[inline]
    pub fn target(&self) -> f64 {
        self.target
    }

    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Jump straight to the target (no ramp)
    pub fn snap(&mut self) {
        self.current = self.target;
    }

    /// Advance one sample and return the smoothed value
    #[inline(always)]
    pub fn next(&mut self) -> Sample {
        self.current += (self.target - self.current) * self.coeff;
        if (self.target - self.current).abs() < 1e-9 {
            self.current = self.target;
        }
        self.current
    }

    /// True while the value is still moving toward the target
    #[inline]
    pub fn is_smoothing(&self) -> bool {
        self.current != self.target
    }
}

impl ProcessorConfig for GainSmoother {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.coeff = Self::calculate_coeff(self.time_constant, sample_rate);
    }
}
