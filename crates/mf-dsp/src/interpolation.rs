//! Polyphase windowed-sinc interpolation
//!
//! Band-limited fractional-position reads for clip resampling. The kernel
//! is tabulated once into `PHASES` sub-sample phases of `TAPS` taps each,
//! so the audio thread only does a table lookup, a linear blend between
//! neighbouring phases and an 8-tap dot product.

use std::f64::consts::PI;

use mf_core::Sample;

/// Taps per phase (4 on each side of the read position)
pub const TAPS: usize = 8;

/// Sub-sample phases in the table
pub const PHASES: usize = 64;

/// Default cutoff relative to Nyquist
pub const DEFAULT_CUTOFF: f64 = 0.95;

/// Offset of the first tap relative to `floor(position)`
const FIRST_TAP: i64 = -(TAPS as i64 / 2 - 1);

/// Blackman-Harris windowed sinc, `x` in samples, support `[-TAPS/2, TAPS/2]`
fn windowed_sinc(x: f64, cutoff: f64) -> f64 {
    let half = TAPS as f64 / 2.0;
    if x.abs() >= half {
        return 0.0;
    }

    let sinc = if x.abs() < 1e-12 {
        cutoff
    } else {
        (PI * cutoff * x).sin() / (PI * x)
    };

    let n = (x + half) / TAPS as f64;
    let tau = 2.0 * PI;
    let window = 0.35875 - 0.48829 * (tau * n).cos() + 0.14128 * (2.0 * tau * n).cos()
        - 0.01168 * (3.0 * tau * n).cos();

    sinc * window
}

/// Pre-computed polyphase sinc kernel
#[derive(Debug, Clone)]
pub struct PolyphaseSinc {
    /// `PHASES + 1` rows so phase blending never wraps
    table: Vec<[f64; TAPS]>,
    cutoff: f64,
}

impl PolyphaseSinc {
    pub fn new() -> Self {
        Self::with_cutoff(DEFAULT_CUTOFF)
    }

    /// Build a kernel with the given cutoff (fraction of Nyquist, 0.1..=1.0)
    pub fn with_cutoff(cutoff: f64) -> Self {
        let cutoff = cutoff.clamp(0.1, 1.0);
        let mut table = Vec::with_capacity(PHASES + 1);

        for phase in 0..=PHASES {
            let frac = phase as f64 / PHASES as f64;
            let mut row = [0.0; TAPS];
            for (tap, coeff) in row.iter_mut().enumerate() {
                let x = (FIRST_TAP + tap as i64) as f64 - frac;
                *coeff = windowed_sinc(x, cutoff);
            }
            // Unity DC gain per phase
            let sum: f64 = row.iter().sum();
            if sum.abs() > 1e-12 {
                row.iter_mut().for_each(|c| *c /= sum);
            }
            table.push(row);
        }

        Self { table, cutoff }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Interpolate at fractional source `position`.
    ///
    /// `frame(i)` returns the source sample at integer index `i`; it must
    /// return 0.0 for indices outside the source.
    #[inline]
    pub fn interpolate(&self, position: f64, frame: impl Fn(i64) -> Sample) -> Sample {
        let base = position.floor();
        let frac = position - base;
        let base = base as i64;

        let scaled = frac * PHASES as f64;
        let phase = (scaled as usize).min(PHASES - 1);
        let blend = scaled - phase as f64;

        let lo = &self.table[phase];
        let hi = &self.table[phase + 1];

        let mut acc = 0.0;
        for tap in 0..TAPS {
            let coeff = lo[tap] + (hi[tap] - lo[tap]) * blend;
            acc += coeff * frame(base + FIRST_TAP + tap as i64);
        }
        acc
    }
}

impl Default for PolyphaseSinc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_integer_positions_are_close_to_source() {
        let kernel = PolyphaseSinc::with_cutoff(1.0);
        let source: Vec<f64> = (0..64).map(|i| (i as f64 * 0.1).sin()).collect();
        let frame = |i: i64| source.get(i as usize).copied().unwrap_or(0.0);

        for i in 8..56 {
            assert_relative_eq!(kernel.interpolate(i as f64, frame), source[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_dc_preserved_at_fractional_positions() {
        let kernel = PolyphaseSinc::new();
        let frame = |i: i64| if (0..100).contains(&i) { 1.0 } else { 0.0 };

        for step in 0..20 {
            let pos = 40.0 + step as f64 * 0.05;
            assert_relative_eq!(kernel.interpolate(pos, frame), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_smooth_signal_midpoint() {
        let kernel = PolyphaseSinc::new();
        let freq = 0.02;
        let frame = |i: i64| (2.0 * PI * freq * i as f64).sin();

        let pos = 30.5;
        let expected = (2.0 * PI * freq * pos).sin();
        assert_relative_eq!(kernel.interpolate(pos, frame), expected, epsilon = 1e-2);
    }
}
