//! 2x-Oversampled Soft Clipper
//!
//! The tanh curve is evaluated twice per input sample: once at the midpoint
//! between the previous and current input (the implicit 2x upsampled point)
//! and once at the input itself. Averaging the two acts as the decimation
//! filter, which keeps the harmonics generated by the nonlinearity from
//! folding back as hard aliasing. Output is normalized by `tanh(drive)` so a
//! full-scale input maps to full scale.

use mf_core::Sample;

use crate::{Processor, StereoProcessor};

/// Default drive constant
pub const DEFAULT_DRIVE: f64 = 1.5;

/// Single-channel oversampled tanh clipper
#[derive(Debug, Clone)]
pub struct SoftClipper {
    drive: f64,
    norm: f64,
    prev: Sample,
}

impl SoftClipper {
    pub fn new(drive: f64) -> Self {
        let drive = if drive.is_finite() && drive > 0.01 { drive } else { DEFAULT_DRIVE };
        Self {
            drive,
            norm: 1.0 / drive.tanh(),
            prev: 0.0,
        }
    }

    #[inline(always)]
    fn shape(&self, x: Sample) -> Sample {
        (self.drive * x).tanh() * self.norm
    }

    #[inline(always)]
    pub fn process(&mut self, input: Sample) -> Sample {
        let mid = 0.5 * (self.prev + input);
        self.prev = input;
        0.5 * (self.shape(mid) + self.shape(input))
    }

    pub fn reset(&mut self) {
        self.prev = 0.0;
    }

    pub fn drive(&self) -> f64 {
        self.drive
    }

    /// Largest magnitude this clipper can emit
    pub fn max_output(&self) -> Sample {
        self.norm
    }
}

impl Default for SoftClipper {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVE)
    }
}

/// Stereo soft clipper
#[derive(Debug, Clone, Default)]
pub struct StereoSoftClipper {
    left: SoftClipper,
    right: SoftClipper,
}

impl StereoSoftClipper {
    pub fn new(drive: f64) -> Self {
        Self {
            left: SoftClipper::new(drive),
            right: SoftClipper::new(drive),
        }
    }
}

impl Processor for StereoSoftClipper {
    fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }
}

impl StereoProcessor for StereoSoftClipper {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        (self.left.process(left), self.right.process(right))
    }
}
