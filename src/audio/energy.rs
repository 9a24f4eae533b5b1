//! Loudness estimation
//!
//! Pure functions over a single window of samples. Callable at frame rate
//! from the capture path without accumulating state.

use super::AudioFrame;

/// Root-mean-square of f32 samples in the device range [-1, 1]
///
/// Returns 0 for an empty window. The result is clamped to [0, 1] so a
/// clipping input cannot push loudness out of range.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt().min(1.0)
}

/// Largest absolute sample value
#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max).min(1.0)
}

/// Loudness of a captured frame
#[must_use]
pub fn loudness(frame: &AudioFrame) -> f32 {
    rms(frame.samples())
}
