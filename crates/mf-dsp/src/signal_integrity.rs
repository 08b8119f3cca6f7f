//! Signal Integrity
//!
//! Output-stage conditioning for the master chain:
//! - DC offset removal (one-pole highpass)
//! - TPDF dither for bit-depth reduction

use std::f64::consts::PI;

use mf_core::Sample;

use crate::{Processor, ProcessorConfig, StereoProcessor};

// ═══════════════════════════════════════════════════════════════════════════════
// DC OFFSET REMOVAL
// ═══════════════════════════════════════════════════════════════════════════════

/// Cutoff of the DC blocker in Hz
const DC_CUTOFF_HZ: f64 = 5.0;

/// DC Offset Removal Filter
///
/// 5Hz highpass filter to remove DC bias that steals headroom.
/// Uses 1-pole IIR for minimal phase distortion.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    /// Filter coefficient
    r: f64,
    /// Previous input
    x1: f64,
    /// Previous output
    y1: f64,
}

impl DcBlocker {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            r: Self::coeff(sample_rate),
            x1: 0.0,
            y1: 0.0,
        }
    }

    // R = 1 - (2π·fc / fs), 0.99935 for 5Hz at 48kHz
    fn coeff(sample_rate: f64) -> f64 {
        (1.0 - (PI * 2.0 * DC_CUTOFF_HZ / sample_rate.max(1000.0))).clamp(0.9, 0.999_999)
    }

    #[inline(always)]
    pub fn process(&mut self, input: Sample) -> Sample {
        // y[n] = x[n] - x[n-1] + R * y[n-1]
        let output = input - self.x1 + self.r * self.y1;
        self.x1 = input;
        self.y1 = output;
        output
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

/// Stereo DC Blocker
#[derive(Debug, Clone)]
pub struct StereoDcBlocker {
    left: DcBlocker,
    right: DcBlocker,
}

impl StereoDcBlocker {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            left: DcBlocker::new(sample_rate),
            right: DcBlocker::new(sample_rate),
        }
    }
}

impl Processor for StereoDcBlocker {
    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }
}

impl ProcessorConfig for StereoDcBlocker {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.left.r = DcBlocker::coeff(sample_rate);
        self.right.r = self.left.r;
    }
}

impl StereoProcessor for StereoDcBlocker {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        (self.left.process(left), self.right.process(right))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TPDF DITHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Default dither target depth
pub const DEFAULT_DITHER_BITS: u32 = 24;

/// TPDF dither + quantizer
#[derive(Debug, Clone)]
pub struct Dither {
    /// Target bit depth
    target_bits: u32,
    /// Quantization step (1 LSB at target depth)
    quant_step: f64,
    /// RNG state (xorshift64)
    rng_state: u64,
}

impl Dither {
    pub fn new(target_bits: u32) -> Self {
        let target_bits = target_bits.clamp(8, 32);
        // Quantization step = 2 / (2^bits)
        let quant_step = 2.0 / (1u64 << target_bits) as f64;

        Self {
            target_bits,
            quant_step,
            rng_state: 0x853c49e6748fea9b,
        }
    }

    pub fn target_bits(&self) -> u32 {
        self.target_bits
    }

    /// Fast xorshift64 random in -1.0..1.0
    #[inline(always)]
    fn next_rand(&mut self) -> f64 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        let r = self.rng_state.wrapping_mul(0x2545F4914F6CDD1D);
        (r as i64 as f64) / (i64::MAX as f64)
    }

    #[inline]
    pub fn process(&mut self, input: Sample) -> Sample {
        let r1 = self.next_rand();
        let r2 = self.next_rand();
        let dithered = input + (r1 + r2) * self.quant_step * 0.5;
        (dithered / self.quant_step).round() * self.quant_step
    }
}

impl Default for Dither {
    fn default() -> Self {
        Self::new(DEFAULT_DITHER_BITS)
    }
}

impl Processor for Dither {
    fn reset(&mut self) {}
}

impl StereoProcessor for Dither {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        (self.process(left), self.process(right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dc_removed() {
        let mut dc = DcBlocker::new(48_000.0);
        let mut out = 0.0;
        for _ in 0..96_000 {
            out = dc.process(0.5);
        }
        assert!(out.abs() < 1e-3);
    }

    #[test]
    fn test_dither_error_bounded_by_one_lsb() {
        let mut dither = Dither::new(16);
        let lsb = 2.0 / 65_536.0;
        for i in 0..1000 {
            let x = (i as f64 * 0.01).sin() * 0.5;
            let y = dither.process(x);
            assert!((y - x).abs() <= lsb * 1.5);
        }
    }
}
