//! Sample types and gain helpers

/// Type alias for audio samples (f64 inside the engine, f32 at the hardware boundary)
pub type Sample = f64;

/// Maximum number of channels a single processing view may expose
pub const MAX_CHANNELS: usize = 8;

/// Convert decibels to linear gain
#[inline]
pub fn db_to_gain(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert linear gain to decibels (floored at -120 dB)
#[inline]
pub fn gain_to_db(gain: f64) -> f64 {
    if gain <= 1e-6 {
        -120.0
    } else {
        20.0 * gain.log10()
    }
}

/// Constant-power pan law. `pan` is -1.0 (left) to 1.0 (right).
#[inline]
pub fn pan_gains(pan: f64) -> (f64, f64) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f64::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}

/// Replace non-finite samples with silence and clamp to `limit`
#[inline(always)]
pub fn sanitize(sample: Sample, limit: Sample) -> Sample {
    if sample.is_finite() {
        sample.clamp(-limit, limit)
    } else {
        0.0
    }
}
