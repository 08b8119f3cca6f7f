//! Algorithmic Reverb
//!
//! Schroeder/Moorer topology sized for aux return use (100% wet):
//! - 8 parallel damped feedback combs per channel
//! - 4 series allpass diffusers per channel
//! - Right channel uses detuned delay lengths for stereo decorrelation
//!
//! All delay memory is allocated in `new()` / `set_sample_rate()`.

use mf_core::Sample;

use crate::{Processor, ProcessorConfig, StereoProcessor};

// ═══════════════════════════════════════════════════════════════════════════════
// TUNING
// ═══════════════════════════════════════════════════════════════════════════════

/// Comb delay lengths in samples at 44.1kHz
const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];

/// Allpass delay lengths in samples at 44.1kHz
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];

/// Extra delay for the right channel
const STEREO_SPREAD: usize = 23;

/// Input attenuation into the comb bank
const INPUT_GAIN: f64 = 0.015;

// ═══════════════════════════════════════════════════════════════════════════════
// BUILDING BLOCKS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Comb {
    buffer: Vec<Sample>,
    pos: usize,
    store: Sample,
}

impl Comb {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
            store: 0.0,
        }
    }

    #[inline(always)]
    fn process(&mut self, input: Sample, feedback: f64, damp: f64) -> Sample {
        let output = self.buffer[self.pos];
        self.store = output * (1.0 - damp) + self.store * damp;
        self.buffer[self.pos] = input + self.store * feedback;
        self.pos += 1;
        if self.pos >= self.buffer.len() {
            self.pos = 0;
        }
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.store = 0.0;
        self.pos = 0;
    }
}

#[derive(Debug, Clone)]
struct Allpass {
    buffer: Vec<Sample>,
    pos: usize,
}

impl Allpass {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            pos: 0,
        }
    }

    #[inline(always)]
    fn process(&mut self, input: Sample) -> Sample {
        let delayed = self.buffer[self.pos];
        let output = delayed - input;
        self.buffer[self.pos] = input + delayed * 0.5;
        self.pos += 1;
        if self.pos >= self.buffer.len() {
            self.pos = 0;
        }
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REVERB
// ═══════════════════════════════════════════════════════════════════════════════

/// Stereo algorithmic reverb
#[derive(Debug, Clone)]
pub struct AlgorithmicReverb {
    combs_l: Vec<Comb>,
    combs_r: Vec<Comb>,
    allpass_l: Vec<Allpass>,
    allpass_r: Vec<Allpass>,
    /// Room size 0..1, mapped to comb feedback
    room_size: f64,
    /// High-frequency damping 0..1
    damping: f64,
    /// Stereo width 0..1
    width: f64,
    feedback: f64,
    sample_rate: f64,
}

impl AlgorithmicReverb {
    pub fn new(sample_rate: f64) -> Self {
        let mut reverb = Self {
            combs_l: Vec::new(),
            combs_r: Vec::new(),
            allpass_l: Vec::new(),
            allpass_r: Vec::new(),
            room_size: 0.7,
            damping: 0.4,
            width: 1.0,
            feedback: 0.0,
            sample_rate,
        };
        reverb.allocate();
        reverb.update_feedback();
        reverb
    }

    fn allocate(&mut self) {
        let scale = self.sample_rate.max(8000.0) / 44_100.0;
        let scaled = |n: usize| ((n as f64) * scale).round() as usize;

        self.combs_l = COMB_TUNING.iter().map(|&n| Comb::new(scaled(n))).collect();
        self.combs_r = COMB_TUNING
            .iter()
            .map(|&n| Comb::new(scaled(n + STEREO_SPREAD)))
            .collect();
        self.allpass_l = ALLPASS_TUNING.iter().map(|&n| Allpass::new(scaled(n))).collect();
        self.allpass_r = ALLPASS_TUNING
            .iter()
            .map(|&n| Allpass::new(scaled(n + STEREO_SPREAD)))
            .collect();
    }

    fn update_feedback(&mut self) {
        self.feedback = 0.7 + self.room_size * 0.28;
    }

    pub fn set_room_size(&mut self, size: f64) {
        self.room_size = size.clamp(0.0, 1.0);
        self.update_feedback();
    }

    pub fn set_damping(&mut self, damping: f64) {
        self.damping = damping.clamp(0.0, 1.0);
    }

    pub fn set_width(&mut self, width: f64) {
        self.width = width.clamp(0.0, 1.0);
    }

    pub fn room_size(&self) -> f64 {
        self.room_size
    }
}

impl Processor for AlgorithmicReverb {
    fn reset(&mut self) {
        self.combs_l.iter_mut().for_each(Comb::clear);
        self.combs_r.iter_mut().for_each(Comb::clear);
        self.allpass_l.iter_mut().for_each(Allpass::clear);
        self.allpass_r.iter_mut().for_each(Allpass::clear);
    }
}

impl ProcessorConfig for AlgorithmicReverb {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.allocate();
    }
}

impl StereoProcessor for AlgorithmicReverb {
    #[inline]
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        let input = (left + right) * INPUT_GAIN;
        let (feedback, damp) = (self.feedback, self.damping * 0.4);

        let mut out_l = 0.0;
        let mut out_r = 0.0;
        for comb in &mut self.combs_l {
            out_l += comb.process(input, feedback, damp);
        }
        for comb in &mut self.combs_r {
            out_r += comb.process(input, feedback, damp);
        }
        for ap in &mut self.allpass_l {
            out_l = ap.process(out_l);
        }
        for ap in &mut self.allpass_r {
            out_r = ap.process(out_r);
        }

        let wet1 = 0.5 * (1.0 + self.width);
        let wet2 = 0.5 * (1.0 - self.width);
        (out_l * wet1 + out_r * wet2, out_r * wet1 + out_l * wet2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impulse_produces_decaying_tail() {
        let mut reverb = AlgorithmicReverb::new(48_000.0);
        reverb.process_sample(1.0, 1.0);

        let mut early = 0.0_f64;
        let mut late = 0.0_f64;
        for i in 0..(48_000 * 4) {
            let (l, r) = reverb.process_sample(0.0, 0.0);
            assert!(l.is_finite() && r.is_finite());
            if i < 24_000 {
                early = early.max(l.abs());
            } else if i > 48_000 * 3 {
                late = late.max(l.abs());
            }
        }
        assert!(early > 0.0);
        assert!(late < early);
    }

    #[test]
    fn test_reset_silences() {
        let mut reverb = AlgorithmicReverb::new(44_100.0);
        for _ in 0..1000 {
            reverb.process_sample(0.5, -0.5);
        }
        reverb.reset();
        let (l, r) = reverb.process_sample(0.0, 0.0);
        assert_eq!((l, r), (0.0, 0.0));
    }
}
