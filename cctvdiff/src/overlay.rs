//! # Detection visualisation

use crate::difference::DifferenceResult;
use crate::error::{Error, Result};
use image::{Rgb, RgbImage};

/// Render the part of a difference map that rises above `floor`.
///
/// Each output pixel takes the brighter channel values of the two source frames, scaled by how far
/// the pixel's magnitude exceeds the floor. Pixels at or below the floor are black.
///
/// # Arguments
///
/// * `prev` - earlier frame of the compared pair.
/// * `curr` - later frame of the compared pair.
/// * `diff` - result of comparing `prev` and `curr`.
/// * `floor` - baseline floor, usually [`BaselineTracker::floor`](crate::baseline::BaselineTracker::floor).
pub fn detection_overlay(
    prev: &RgbImage,
    curr: &RgbImage,
    diff: &DifferenceResult,
    floor: f64,
) -> Result<RgbImage> {
    let dims = (diff.width, diff.height);

    for found in [prev.dimensions(), curr.dimensions()] {
        if found != dims {
            return Err(Error::SizeMismatch {
                expected: dims,
                found,
            });
        }
    }

    let mut out = RgbImage::new(diff.width, diff.height);

    for ((o, (a, b)), m) in out
        .pixels_mut()
        .zip(prev.pixels().zip(curr.pixels()))
        .zip(&diff.magnitudes)
    {
        let excess = (m - floor).max(0.0);
        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = a.0[c].max(b.0[c]) as f64 * excess / 255.0;
            px[c] = v.clamp(0.0, 255.0) as u8;
        }
        *o = Rgb(px);
    }

    Ok(out)
}
