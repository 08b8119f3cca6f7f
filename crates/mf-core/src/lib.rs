//! mf-core: Shared types, traits, and utilities for Mixframe
//!
//! This crate provides the foundational value types used across the
//! Mixframe crates: samples and gain conversion, the tempo map, MIDI
//! messages and the common error type.

mod error;
mod midi;
mod sample;
mod tempo;

pub use error::*;
pub use midi::*;
pub use sample::*;
pub use tempo::*;

/// Beat grid resolution used for automation point deduplication (1/128 beat)
pub const BEAT_EPSILON: f64 = 1.0 / 128.0;

/// Decibel value wrapper
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Decibels(pub f64);

impl Decibels {
    pub const ZERO: Self = Self(0.0);
    pub const NEG_INF: Self = Self(f64::NEG_INFINITY);

    #[inline]
    pub fn from_gain(gain: f64) -> Self {
        if gain <= 0.0 {
            Self::NEG_INF
        } else {
            Self(20.0 * gain.log10())
        }
    }

    #[inline]
    pub fn to_gain(self) -> f64 {
        if self.0 <= -144.0 {
            0.0
        } else {
            10.0_f64.powf(self.0 / 20.0)
        }
    }
}

impl Default for Decibels {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Validate a hardware sample rate
pub fn validate_sample_rate(sample_rate: f64) -> MfResult<f64> {
    if sample_rate.is_finite() && (8_000.0..=768_000.0).contains(&sample_rate) {
        Ok(sample_rate)
    } else {
        Err(MfError::InvalidSampleRate(sample_rate as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decibels_roundtrip() {
        assert_relative_eq!(Decibels(-6.0).to_gain(), 0.501_187, epsilon = 1e-5);
        assert_relative_eq!(Decibels::from_gain(1.0).0, 0.0);
        assert_eq!(Decibels::from_gain(0.0), Decibels::NEG_INF);
        assert_eq!(Decibels(-200.0).to_gain(), 0.0);
    }

    #[test]
    fn test_validate_sample_rate() {
        assert!(validate_sample_rate(48_000.0).is_ok());
        assert!(validate_sample_rate(0.0).is_err());
        assert!(validate_sample_rate(f64::NAN).is_err());
    }
}
