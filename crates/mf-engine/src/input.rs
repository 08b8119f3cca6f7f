//! Live input tap
//!
//! At the top of every block the raw interleaved hardware input is
//! published through a double buffer (for scopes, tuners, ...), split into
//! planar stereo buffers for monitoring tracks and the recorders, and
//! metered.

use mf_core::Sample;

use crate::config::MAX_BLOCK_SIZE;
use crate::double_buffer::{DoubleBufferReader, DoubleBufferWriter, double_buffer};

/// Live input peak and RMS of one block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputLevels {
    pub peak: f64,
    pub rms: f64,
}

/// Audio-thread input capture
pub struct InputTap {
    channels: usize,
    /// Planar stereo copy of the block; mono input is duplicated
    planar: [Vec<Sample>; 2],
    frames: usize,
    raw: DoubleBufferWriter,
}

impl InputTap {
    /// Tap for `channels` interleaved input channels, blocks up to `max_block` frames.
    ///
    /// The raw feed is sized for the largest block any `prepare` accepts, so
    /// readers handed out here stay valid across reconfiguration.
    pub fn new(channels: usize, max_block: usize) -> (Self, DoubleBufferReader) {
        let (raw, reader) = double_buffer(MAX_BLOCK_SIZE.max(max_block) * channels);
        (
            Self {
                channels,
                planar: [vec![0.0; max_block], vec![0.0; max_block]],
                frames: 0,
                raw,
            },
            reader,
        )
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capture `frames` frames of interleaved `input`. Missing samples read as silence.
    pub fn capture(&mut self, input: &[f32], frames: usize) -> InputLevels {
        let frames = frames.min(self.planar[0].len());
        self.frames = frames;

        let [left, right] = &mut self.planar;
        if self.channels == 0 {
            left[..frames].fill(0.0);
            right[..frames].fill(0.0);
            return InputLevels::default();
        }

        let used = (frames * self.channels).min(input.len());
        self.raw.publish_block(&input[..used]);

        let mut peak: f64 = 0.0;
        let mut sum = 0.0;
        for i in 0..frames {
            let base = i * self.channels;
            let l = input.get(base).copied().unwrap_or(0.0) as Sample;
            let r = if self.channels > 1 {
                input.get(base + 1).copied().unwrap_or(0.0) as Sample
            } else {
                l
            };
            left[i] = l;
            right[i] = r;
            peak = peak.max(l.abs()).max(r.abs());
            sum += 0.5 * (l * l + r * r);
        }

        let rms = if frames > 0 { (sum / frames as f64).sqrt() } else { 0.0 };
        InputLevels { peak, rms }
    }

    /// Planar stereo input of the last captured block
    pub fn planar(&self) -> (&[Sample], &[Sample]) {
        (&self.planar[0][..self.frames], &self.planar[1][..self.frames])
    }

    /// Reallocate the planar buffers for blocks up to `max_block` frames
    pub fn prepare(&mut self, max_block: usize) {
        self.planar = [vec![0.0; max_block], vec![0.0; max_block]];
        self.frames = 0;
        self.raw.reset();
    }

    pub fn clear(&mut self) {
        self.planar.iter_mut().for_each(|c| c.fill(0.0));
        self.frames = 0;
        self.raw.reset();
    }
}
