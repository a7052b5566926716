//! # Spatial convolution kernel

use crate::error::{Error, Result};
use nalgebra as na;
use std::str::FromStr;

/// Small weight matrix blended over the difference map.
///
/// Parsed from strings of the form `1,2,1;2,4,2;1,2,1*1/16`: rows are separated by `;`, columns
/// by `,`, and an optional multiplier follows `*` (either a number or a `num/den` fraction). A bare
/// `/den` suffix is shorthand for `*1/den`.
///
/// Both dimensions are padded with zero weights up to the next odd number, so every kernel has an
/// exact centre tap at `((width - 1) / 2, (height - 1) / 2)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvolutionKernel {
    weights: na::DMatrix<f64>,
    multiplier: f64,
}

impl ConvolutionKernel {
    /// Create a kernel from a weight matrix and multiplier.
    ///
    /// Returns `None` if the matrix is empty.
    pub fn new(weights: na::DMatrix<f64>, multiplier: f64) -> Option<Self> {
        if weights.is_empty() {
            None
        } else {
            Some(Self {
                weights,
                multiplier,
            })
        }
    }

    pub fn width(&self) -> usize {
        self.weights.ncols()
    }

    pub fn height(&self) -> usize {
        self.weights.nrows()
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Position of the tap that lines up with the output pixel.
    pub fn center(&self) -> (usize, usize) {
        ((self.width() - 1) / 2, (self.height() - 1) / 2)
    }

    /// Weight at column `x`, row `y`.
    pub fn weight(&self, x: usize, y: usize) -> f64 {
        self.weights[(y, x)]
    }

    /// Convolve a row-major `width` x `height` map.
    ///
    /// Taps that fall outside of the map are skipped, which means border pixels are computed from
    /// fewer samples rather than from padded, clamped or wrapped ones.
    pub fn apply(&self, map: &[f64], width: usize, height: usize) -> Vec<f64> {
        let (cx, cy) = self.center();
        let (kw, kh) = (self.width(), self.height());
        let mut out = Vec::with_capacity(map.len());

        for y in 0..height {
            for x in 0..width {
                let mut val = 0.0;

                for my in 0..kh {
                    let sy = match (y + my).checked_sub(cy) {
                        Some(sy) if sy < height => sy,
                        _ => continue,
                    };

                    for mx in 0..kw {
                        let sx = match (x + mx).checked_sub(cx) {
                            Some(sx) if sx < width => sx,
                            _ => continue,
                        };

                        val += self.weights[(my, mx)] * map[sx + sy * width];
                    }
                }

                out.push(val * self.multiplier);
            }
        }

        out
    }
}

impl FromStr for ConvolutionKernel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        let (matrix, multiplier) = if let Some((matrix, mul)) = s.split_once('*') {
            let mul = match mul.split_once('/') {
                Some((num, den)) => parse_weight(num)? / parse_divisor(den)?,
                None => parse_weight(mul)?,
            };
            (matrix, mul)
        } else if let Some((matrix, den)) = s.split_once('/') {
            (matrix, 1.0 / parse_divisor(den)?)
        } else {
            (s, 1.0)
        };

        let rows = matrix
            .trim()
            .trim_end_matches(';')
            .split(';')
            .map(|row| row.split(',').map(parse_weight).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;

        let nrows = rows.len() | 1;
        let ncols = rows.iter().map(Vec::len).max().unwrap_or(1).max(1) | 1;

        let weights = na::DMatrix::from_fn(nrows, ncols, |r, c| {
            rows.get(r)
                .and_then(|row| row.get(c))
                .copied()
                .unwrap_or(0.0)
        });

        Self::new(weights, multiplier)
            .ok_or_else(|| Error::Config(format!("empty convolution matrix '{s}'")))
    }
}

fn parse_weight(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        Ok(0.0)
    } else {
        s.parse()
            .map_err(|_| Error::Config(format!("invalid matrix value '{s}'")))
    }
}

fn parse_divisor(s: &str) -> Result<f64> {
    match parse_weight(s)? {
        d if d == 0.0 => Err(Error::Config(format!("matrix divisor '{}' is zero", s.trim()))),
        d => Ok(d),
    }
}
