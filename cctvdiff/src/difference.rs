//! # Frame differencing
//!
//! Reduces a pair of equally sized frames to a per-pixel difference magnitude map and a few
//! scalar statistics describing it.

use crate::correction::CorrectionMap;
use crate::error::{Error, Result};
use crate::frame::{pixels, Frame};
use crate::kernel::ConvolutionKernel;
use image::RgbImage;
use nalgebra as na;

/// Tunables of the difference engine.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct DifferenceSettings {
    /// Per channel (red, green, blue) scale applied to the raw difference.
    pub channel_scale: [f64; 3],
    /// Global factor applied to the final magnitude map.
    pub diff_gain: f64,
    /// Fraction of the largest magnitude a pixel needs to reach to count towards `avg` and `sd`.
    pub diff_threshold: f64,
}

impl Default for DifferenceSettings {
    fn default() -> Self {
        Self {
            channel_scale: [1.0; 3],
            diff_gain: 1.0,
            diff_threshold: 0.25,
        }
    }
}

/// Result of comparing two frames.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DifferenceResult {
    pub width: u32,
    pub height: u32,
    /// Row-major magnitude map, `width * height` entries.
    pub magnitudes: Vec<f64>,
    /// Mean magnitude of the pixels at or above `threshold`.
    pub avg: f64,
    /// Standard deviation of the pixels at or above `threshold`.
    pub sd: f64,
    /// Mean magnitude over the whole map.
    pub raw_level: f64,
    pub max_magnitude: f64,
    /// Magnitude cut-off used for `avg` and `sd`.
    pub threshold: f64,
}

/// Difference engine of a single source.
///
/// Holds the configured convolution kernel and gain map. The gain map is resampled whenever the
/// frame size changes, so the engine keeps some state between calls.
#[derive(Default)]
pub struct DifferenceEngine {
    settings: DifferenceSettings,
    kernel: Option<ConvolutionKernel>,
    gain: Option<CorrectionMap>,
}

impl DifferenceEngine {
    pub fn new(settings: DifferenceSettings) -> Self {
        Self {
            settings,
            kernel: None,
            gain: None,
        }
    }

    pub fn settings(&self) -> &DifferenceSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: DifferenceSettings) {
        self.settings = settings;
    }

    /// Set or remove the convolution kernel. Without one the map is not blended spatially.
    pub fn set_kernel(&mut self, kernel: Option<ConvolutionKernel>) {
        self.kernel = kernel;
    }

    /// Set or remove the gain image. Without one every pixel has unit gain.
    pub fn set_gain(&mut self, gain: Option<RgbImage>) {
        self.gain = gain.map(CorrectionMap::gain);
    }

    /// Compare two retained frames.
    pub fn compute(&mut self, prev: &Frame, curr: &Frame) -> Result<DifferenceResult> {
        self.compare(prev.image(), curr.image())
    }

    /// Compare two images of equal size.
    ///
    /// # Remarks
    ///
    /// The per-line mean of the difference is removed before anything else. This cancels global
    /// brightness changes and horizontal banding, so only non-uniform changes between the frames
    /// produce a non-zero map.
    pub fn compare(&mut self, prev: &RgbImage, curr: &RgbImage) -> Result<DifferenceResult> {
        if prev.dimensions() != curr.dimensions() {
            return Err(Error::SizeMismatch {
                expected: prev.dimensions(),
                found: curr.dimensions(),
            });
        }

        let (width, height) = prev.dimensions();
        let (w, h) = (width as usize, height as usize);
        let len = w * h;

        if len == 0 {
            return Ok(DifferenceResult {
                width,
                height,
                ..Default::default()
            });
        }

        let scale = na::Vector3::from(self.settings.channel_scale);
        let mut deltas = Vec::with_capacity(len);
        let mut global = na::Vector3::zeros();

        for (row1, row2) in pixels(prev).chunks_exact(w).zip(pixels(curr).chunks_exact(w)) {
            let start = deltas.len();

            deltas.extend(
                row1.iter()
                    .zip(row2)
                    .map(|(a, b)| (a.as_vector() - b.as_vector()).component_mul(&scale)),
            );

            let line = &mut deltas[start..];
            let line_mean = line.iter().fold(na::Vector3::zeros(), |acc, d| acc + d) / w as f64;

            for d in line.iter_mut() {
                *d -= line_mean;
                global += *d;
            }
        }

        global /= len as f64;

        let gain = self.gain.as_mut().map(|g| g.values(width, height));

        let mut magnitudes: Vec<f64> = deltas
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let d = d - global;
                match gain {
                    Some(gain) => d.component_mul(&gain[i]).norm(),
                    None => d.norm(),
                }
            })
            .collect();

        if let Some(kernel) = &self.kernel {
            magnitudes = kernel.apply(&magnitudes, w, h);
        }

        let diff_gain = self.settings.diff_gain;
        if diff_gain != 1.0 {
            magnitudes.iter_mut().for_each(|m| *m *= diff_gain);
        }

        let max_magnitude = magnitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let threshold = self.settings.diff_threshold * max_magnitude;

        let (n, sum, sum2) = magnitudes
            .iter()
            .filter(|&&m| m >= threshold)
            .fold((0usize, 0.0, 0.0), |(n, s, s2), &m| (n + 1, s + m, s2 + m * m));

        let (avg, sd) = if n > 0 {
            let avg = sum / n as f64;
            (avg, (sum2 / n as f64 - avg * avg).max(0.0).sqrt())
        } else {
            (0.0, 0.0)
        };

        let raw_level = magnitudes.iter().sum::<f64>() / len as f64;

        Ok(DifferenceResult {
            width,
            height,
            magnitudes,
            avg,
            sd,
            raw_level,
            max_magnitude,
            threshold,
        })
    }
}
