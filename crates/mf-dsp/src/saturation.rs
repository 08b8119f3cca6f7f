//! Safety Saturation
//!
//! Gentle tanh saturation used on aux returns while the engine runs in
//! reduced-feedback mode. Unlike the master soft clipper it is not
//! normalized: it only ever pulls level down, so a runaway feedback loop
//! through a return bus converges instead of growing.

use mf_core::Sample;

use crate::{MonoProcessor, Processor, StereoProcessor};

/// Tanh saturator with input drive and fixed output ceiling
#[derive(Debug, Clone)]
pub struct Saturator {
    drive: f64,
    ceiling: f64,
}

impl Saturator {
    pub fn new(drive: f64, ceiling: f64) -> Self {
        Self {
            drive: drive.max(0.1),
            ceiling: ceiling.clamp(0.05, 4.0),
        }
    }
}

impl Default for Saturator {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl Processor for Saturator {
    fn reset(&mut self) {}
}

impl MonoProcessor for Saturator {
    #[inline]
    fn process_sample(&mut self, input: Sample) -> Sample {
        self.ceiling * (self.drive * input / self.ceiling).tanh() / self.drive.max(1.0)
    }
}

impl StereoProcessor for Saturator {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        (
            MonoProcessor::process_sample(self, left),
            MonoProcessor::process_sample(self, right),
        )
    }
}
