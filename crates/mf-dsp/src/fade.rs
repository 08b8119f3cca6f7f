//! Clip fade laws
//!
//! Equal-power (quarter-sine) fades expressed in beats, plus short linear
//! micro-fades in samples that keep clip edges click-free when no musical
//! fade is set.

use std::f64::consts::FRAC_PI_2;

/// Default micro-fade length in samples
pub const MICRO_FADE_SAMPLES: usize = 64;

/// Equal-power fade-in gain at `position` beats into a fade of `length` beats.
///
/// 0 at the start, 1 at `length`, monotonic in between. A zero-length fade
/// is always unity.
#[inline]
pub fn fade_in_gain(position: f64, length: f64) -> f64 {
    if length <= 0.0 || !length.is_finite() {
        return 1.0;
    }
    let t = (position / length).clamp(0.0, 1.0);
    (FRAC_PI_2 * t).sin()
}

/// Equal-power fade-out gain with `remaining` beats left before the end
#[inline]
pub fn fade_out_gain(remaining: f64, length: f64) -> f64 {
    fade_in_gain(remaining, length)
}

/// Fade shape of a clip, all lengths in beats
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipFades {
    pub fade_in: f64,
    pub fade_out: f64,
    pub crossfade_in: f64,
    pub crossfade_out: f64,
}

impl ClipFades {
    /// Gain at `position` beats into a clip of `length` beats.
    ///
    /// A crossfade lengthens the corresponding fade; it never shortens it.
    #[inline]
    pub fn gain_at(&self, position: f64, length: f64) -> f64 {
        if position < 0.0 || position > length {
            return 0.0;
        }
        let fade_in = self.fade_in.max(self.crossfade_in).min(length);
        let fade_out = self.fade_out.max(self.crossfade_out).min(length);
        fade_in_gain(position, fade_in) * fade_out_gain(length - position, fade_out)
    }

    pub fn is_flat(&self) -> bool {
        self.fade_in <= 0.0 && self.fade_out <= 0.0 && self.crossfade_in <= 0.0 && self.crossfade_out <= 0.0
    }
}

/// Linear micro-fade gain for a sample `from_start` samples after the clip
/// start and `to_end` samples before its end.
#[inline]
pub fn micro_fade_gain(from_start: usize, to_end: usize, length: usize) -> f64 {
    if length == 0 {
        return 1.0;
    }
    let edge = from_start.min(to_end);
    if edge >= length {
        1.0
    } else {
        (edge as f64 + 0.5) / length as f64
    }
}
