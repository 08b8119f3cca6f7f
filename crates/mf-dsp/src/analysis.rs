//! Audio analysis: block meters and spectrum
//!
//! `BlockMeter` runs on the audio thread once per block (no allocation).
//! `SpectrumAnalyzer` runs on the display side over windows published by
//! the engine's analyzer feed.

use std::sync::Arc;

use mf_core::{Sample, gain_to_db};
use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Minimum FFT size
const MIN_FFT_SIZE: usize = 64;
/// Maximum FFT size
const MAX_FFT_SIZE: usize = 32768;
/// Default FFT size
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Loudness floor reported for silence
pub const LOUDNESS_FLOOR: f64 = -120.0;

// ============================================================================
// BLOCK METER
// ============================================================================

/// Stereo statistics of one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockStats {
    pub peak_l: f64,
    pub peak_r: f64,
    pub rms_l: f64,
    pub rms_r: f64,
    /// Phase correlation -1..1 (0 for silence)
    pub correlation: f64,
    /// Approximate short-term loudness, RMS based
    pub loudness: f64,
}

impl Default for BlockStats {
    fn default() -> Self {
        Self {
            peak_l: 0.0,
            peak_r: 0.0,
            rms_l: 0.0,
            rms_r: 0.0,
            correlation: 0.0,
            loudness: LOUDNESS_FLOOR,
        }
    }
}

impl BlockStats {
    pub fn peak(&self) -> f64 {
        self.peak_l.max(self.peak_r)
    }
}

/// Single-pass stereo block meter
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockMeter;

impl BlockMeter {
    /// Measure a stereo block
    pub fn measure(left: &[Sample], right: &[Sample]) -> BlockStats {
        let len = left.len().min(right.len());
        if len == 0 {
            return BlockStats::default();
        }

        let mut peak_l: f64 = 0.0;
        let mut peak_r: f64 = 0.0;
        let mut sum_ll = 0.0;
        let mut sum_rr = 0.0;
        let mut sum_lr = 0.0;

        for (&l, &r) in left[..len].iter().zip(&right[..len]) {
            peak_l = peak_l.max(l.abs());
            peak_r = peak_r.max(r.abs());
            sum_ll += l * l;
            sum_rr += r * r;
            sum_lr += l * r;
        }

        let n = len as f64;
        let denom = (sum_ll * sum_rr).sqrt();
        let correlation = if denom > 1e-20 {
            (sum_lr / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        Self::finish(peak_l, peak_r, sum_ll / n, sum_rr / n, correlation)
    }

    fn finish(peak_l: f64, peak_r: f64, ms_l: f64, ms_r: f64, correlation: f64) -> BlockStats {
        BlockStats {
            peak_l,
            peak_r,
            rms_l: ms_l.sqrt(),
            rms_r: ms_r.sqrt(),
            correlation,
            loudness: loudness_estimate(ms_l + ms_r),
        }
    }
}

/// LUFS-style estimate from summed channel mean square (no K-weighting)
#[inline]
pub fn loudness_estimate(mean_square: f64) -> f64 {
    if mean_square <= 1e-12 {
        LOUDNESS_FLOOR
    } else {
        (-0.691 + 10.0 * mean_square.log10()).max(LOUDNESS_FLOOR)
    }
}

// ============================================================================
// SPECTRUM ANALYZER
// ============================================================================

/// FFT analyzer for spectrum display
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f64>>,
    fft_size: usize,
    window: Vec<f64>,
    scratch: Vec<f64>,
    output: Vec<Complex<f64>>,
    magnitudes: Vec<f64>,
    /// Smoothing factor 0..1 (0 = none)
    smoothing: f64,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = if (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&fft_size) && fft_size.is_power_of_two() {
            fft_size
        } else {
            log::warn!("Invalid FFT size {fft_size}, using {DEFAULT_FFT_SIZE}");
            DEFAULT_FFT_SIZE
        };

        let mut planner = RealFftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let bins = fft_size / 2 + 1;

        // Hann window
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (fft_size - 1) as f64).cos()))
            .collect();

        Self {
            fft,
            fft_size,
            window,
            scratch: vec![0.0; fft_size],
            output: vec![Complex::new(0.0, 0.0); bins],
            magnitudes: vec![LOUDNESS_FLOOR; bins],
            smoothing: 0.0,
        }
    }

    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing.clamp(0.0, 0.99);
        self
    }

    /// Analyze one window. Shorter input is zero-padded, longer input truncated.
    pub fn analyze(&mut self, samples: &[Sample]) -> &[f64] {
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = samples.get(i).copied().unwrap_or(0.0) * self.window[i];
        }

        if self.fft.process(&mut self.scratch, &mut self.output).is_err() {
            self.magnitudes.fill(LOUDNESS_FLOOR);
            return &self.magnitudes;
        }

        // Hann coherent gain is 0.5
        let scale = 4.0 / self.fft_size as f64;
        for (mag, c) in self.magnitudes.iter_mut().zip(&self.output) {
            let db = gain_to_db(c.norm() * scale);
            *mag = *mag * self.smoothing + db * (1.0 - self.smoothing);
        }
        &self.magnitudes
    }

    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn bin_to_freq(&self, bin: usize, sample_rate: f64) -> f64 {
        bin as f64 * sample_rate / self.fft_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_block_meter_mono_signal() {
        let left: Vec<f64> = (0..480).map(|i| (i as f64 * 0.1).sin() * 0.5).collect();
        let stats = BlockMeter::measure(&left, &left);

        assert_relative_eq!(stats.correlation, 1.0, epsilon = 1e-9);
        assert!(stats.peak_l <= 0.5 && stats.peak_l > 0.49);
        assert_relative_eq!(stats.rms_l, stats.rms_r);
        assert!(stats.loudness > LOUDNESS_FLOOR);
    }

    #[test]
    fn test_block_meter_inverted() {
        let left = vec![0.3; 64];
        let right = vec![-0.3; 64];
        let stats = BlockMeter::measure(&left, &right);
        assert_relative_eq!(stats.correlation, -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_block_meter_silence() {
        let zeros = vec![0.0; 128];
        let stats = BlockMeter::measure(&zeros, &zeros);
        assert_eq!(stats.correlation, 0.0);
        assert_eq!(stats.loudness, LOUDNESS_FLOOR);
        assert_eq!(BlockMeter::measure(&[], &[]), BlockStats::default());
    }

    #[test]
    fn test_loudness_estimate() {
        // Full scale sine on both channels: ms 0.5 + 0.5
        assert_relative_eq!(loudness_estimate(1.0), -0.691, epsilon = 1e-9);
    }

    #[test]
    fn test_spectrum_peak_bin() {
        let mut analyzer = SpectrumAnalyzer::new(1024);
        let sr = 48_000.0;
        let bin = 64;
        let freq = analyzer.bin_to_freq(bin, sr);
        let window: Vec<f64> = (0..1024)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sr).sin())
            .collect();

        let mags = analyzer.analyze(&window);
        let (peak_bin, peak_db) = mags
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, &m)| if m > acc.1 { (i, m) } else { acc });

        assert_eq!(peak_bin, bin);
        assert!(peak_db > -1.0 && peak_db < 1.0);
    }

    #[test]
    fn test_invalid_fft_size_falls_back() {
        assert_eq!(SpectrumAnalyzer::new(1000).fft_size(), DEFAULT_FFT_SIZE);
        assert_eq!(SpectrumAnalyzer::new(4096).bin_count(), 2049);
    }
}
