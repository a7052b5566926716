//! # Per-pixel correction maps
//!
//! Gain and mask images are configured independently of the camera resolution. They are
//! stretched onto the active frame size with nearest-neighbour sampling, and only recomputed when
//! the frame size changes.

use crate::frame::{pixels, RGB};
use image::RgbImage;
use nalgebra as na;

/// How sampled values are scaled after resampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scaling {
    /// Each channel in `0..=1`.
    Unit,
    /// Scaled so the values average to 1 across all channels.
    MeanOne,
}

/// A correction image resampled onto the active frame grid.
pub struct CorrectionMap {
    source: RgbImage,
    scaling: Scaling,
    dims: (u32, u32),
    values: Vec<na::Vector3<f64>>,
}

impl CorrectionMap {
    /// Gain map: weights the per-channel difference during differencing.
    ///
    /// Values are normalised so that their mean is 1, which keeps a gain image from shifting the
    /// overall level, it only redistributes sensitivity.
    pub fn gain(source: RgbImage) -> Self {
        Self::new(source, Scaling::MeanOne)
    }

    /// Mask: multiplied into each frame as it is loaded. White keeps a pixel, black blanks it.
    pub fn mask(source: RgbImage) -> Self {
        Self::new(source, Scaling::Unit)
    }

    fn new(source: RgbImage, scaling: Scaling) -> Self {
        Self {
            source,
            scaling,
            dims: (0, 0),
            values: vec![],
        }
    }

    /// Correction values for a `width` x `height` frame, in row-major order.
    ///
    /// The returned slice always holds exactly `width * height` entries.
    pub fn values(&mut self, width: u32, height: u32) -> &[na::Vector3<f64>] {
        if self.dims != (width, height) || self.values.is_empty() {
            self.values = resample(&self.source, width, height);
            if self.scaling == Scaling::MeanOne {
                normalise(&mut self.values);
            }
            self.dims = (width, height);
        }
        &self.values
    }

    /// Multiply the map into the image in place.
    pub fn apply(&mut self, image: &mut RgbImage) {
        let (w, h) = image.dimensions();
        let values = self.values(w, h);
        for (px, m) in image.pixels_mut().zip(values) {
            for c in 0..3 {
                px.0[c] = (px.0[c] as f64 * m[c]).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Nearest-neighbour map `source` onto a `width` x `height` grid.
///
/// Each channel is converted to `0..=1`. An empty source image maps to white.
pub fn resample(source: &RgbImage, width: u32, height: u32) -> Vec<na::Vector3<f64>> {
    let (sw, sh) = source.dimensions();
    let len = width as usize * height as usize;

    if sw == 0 || sh == 0 {
        return vec![na::Vector3::repeat(1.0); len];
    }

    let src = pixels(source);
    let mut out = Vec::with_capacity(len);

    for y in 0..height as u64 {
        let sy = nearest(y, sh as u64, height as u64);
        for x in 0..width as u64 {
            let sx = nearest(x, sw as u64, width as u64);
            let RGB { r, g, b } = src[sx + sy * sw as usize];
            out.push(na::Vector3::new(r as f64, g as f64, b as f64) / 255.0);
        }
    }

    out
}

/// Source coordinate for destination coordinate `pos`, rounding to the nearest source sample.
fn nearest(pos: u64, src_len: u64, dst_len: u64) -> usize {
    let s = (pos * src_len + dst_len / 2) / dst_len;
    std::cmp::min(s, src_len - 1) as usize
}

fn normalise(values: &mut [na::Vector3<f64>]) {
    let sum: f64 = values.iter().map(|v| v.sum()).sum();
    if sum > 0.0 {
        let scale = (values.len() * 3) as f64 / sum;
        values.iter_mut().for_each(|v| *v *= scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use image::Rgb;

    #[test]
    fn resample_matches_target_size() {
        let src = RgbImage::from_pixel(7, 3, Rgb([255, 0, 128]));
        for (w, h) in [(1, 1), (4, 4), (640, 480), (13, 2)] {
            assert_eq!(resample(&src, w, h).len(), (w * h) as usize);
        }
    }

    #[test]
    fn resample_nearest_neighbour() {
        let mut src = RgbImage::new(2, 2);
        src.put_pixel(0, 0, Rgb([255, 0, 0]));
        src.put_pixel(1, 0, Rgb([0, 255, 0]));
        src.put_pixel(0, 1, Rgb([0, 0, 255]));
        src.put_pixel(1, 1, Rgb([255, 255, 255]));

        let out = resample(&src, 4, 4);
        // Top-left quadrant comes from the red sample. Rounding shifts the boundary by one
        // destination pixel, so only the corners are unambiguous.
        assert_eq!(out[0], na::Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(out[3], na::Vector3::new(0.0, 1.0, 0.0));
        assert_eq!(out[12], na::Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(out[15], na::Vector3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn gain_is_mean_one() {
        let mut src = RgbImage::from_pixel(2, 1, Rgb([255, 255, 255]));
        src.put_pixel(1, 0, Rgb([85, 85, 85]));

        let mut gain = CorrectionMap::gain(src);
        let values = gain.values(8, 8);
        let mean = values.iter().map(|v| v.sum()).sum::<f64>() / (values.len() * 3) as f64;
        assert_approx_eq!(mean, 1.0, 1e-9);
        assert!(values[0].x > values[7].x);
    }

    #[test]
    fn values_follow_frame_size() {
        let mut gain = CorrectionMap::gain(RgbImage::from_pixel(3, 3, Rgb([10, 20, 30])));
        assert_eq!(gain.values(4, 4).len(), 16);
        assert_eq!(gain.values(2, 8).len(), 16);
        assert_eq!(gain.values(5, 1).len(), 5);
    }

    #[test]
    fn black_gain_is_left_unscaled() {
        let mut gain = CorrectionMap::gain(RgbImage::new(2, 2));
        assert!(gain.values(3, 3).iter().all(|v| v.sum() == 0.0));
    }
}
