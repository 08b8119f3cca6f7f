//! mf-dsp: DSP processors for Mixframe
//!
//! Allocation-free processing blocks for the real-time path. Everything
//! that needs memory allocates it in `new()` / `set_sample_rate()`.
//!
//! ## Modules
//! - `smoothing` - Exponential gain dezippering
//! - `soft_clip` - 2x-oversampled tanh soft clipper
//! - `limiter` - Stereo-linked peak limiter with intersample detection
//! - `signal_integrity` - DC blocker and TPDF dither
//! - `saturation` - Safety saturation stage for feedback-prone buses
//! - `reverb` - Algorithmic (comb/allpass) reverb for aux returns
//! - `interpolation` - Polyphase windowed-sinc resampling kernel
//! - `fade` - Equal-power fade law and micro-fades
//! - `analysis` - Block meters and FFT spectrum analyzer

pub mod analysis;
pub mod fade;
pub mod interpolation;
pub mod limiter;
pub mod reverb;
pub mod saturation;
pub mod signal_integrity;
pub mod smoothing;
pub mod soft_clip;

use mf_core::Sample;

/// Trait for all DSP processors
pub trait Processor: Send {
    /// Reset processor state
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}

/// Mono processor trait
pub trait MonoProcessor: Processor {
    /// Process a single sample
    fn process_sample(&mut self, input: Sample) -> Sample;

    /// Process a block of samples
    fn process_block(&mut self, buffer: &mut [Sample]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }
}

/// Stereo processor trait
pub trait StereoProcessor: Processor {
    /// Process a stereo sample pair
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample);

    /// Process stereo blocks
    fn process_block(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        debug_assert_eq!(left.len(), right.len());
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            (*l, *r) = self.process_sample(*l, *r);
        }
    }
}

/// Processor configuration for sample rate changes
pub trait ProcessorConfig {
    fn set_sample_rate(&mut self, sample_rate: f64);
}
