//! # One-shot comparison of two images

use crate::output::write_jpeg;
use crate::source_config::SourceConfig;
use anyhow::{Context, Result};
use cctvdiff::prelude::v1::*;
use chrono::Local;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Everything the pipeline computed for a single image pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompareReport {
    pub width: u32,
    pub height: u32,
    pub avg: f64,
    pub sd: f64,
    pub raw_level: f64,
    pub max_magnitude: f64,
    pub diff_threshold: f64,
    pub baseline: Baseline,
    pub floor: f64,
    pub level: f64,
    pub threshold: f64,
    pub detected: bool,
}

impl fmt::Display for CompareReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.baseline;
        writeln!(f, "size: {}x{}", self.width, self.height)?;
        writeln!(f, "avg: {:.4}", self.avg)?;
        writeln!(f, "sd: {:.4}", self.sd)?;
        writeln!(f, "rawlevel: {:.4}", self.raw_level)?;
        writeln!(f, "diffthreshold: {:.4}", self.diff_threshold)?;
        writeln!(
            f,
            "baseline: fastavg {:.4} fastsd {:.4} slowavg {:.4} slowsd {:.4}",
            b.fast_avg, b.fast_sd, b.slow_avg, b.slow_sd
        )?;
        write!(
            f,
            "level: {:.4} (threshold {:.4}, {})",
            self.level,
            self.threshold,
            if self.detected {
                "detection"
            } else {
                "no detection"
            }
        )
    }
}

/// Run the detection pipeline once over `image1` followed by `image2`.
///
/// # Arguments
///
/// * `config` - resolved configuration of the source the images are treated as coming from.
/// * `state` - baseline to start from, usually the persisted one.
/// * `output` - optional path of the detection visualisation image.
pub fn compare(
    config: &SourceConfig,
    state: BaselineState,
    image1: &Path,
    image2: &Path,
    output: Option<&Path>,
) -> Result<CompareReport> {
    let mut store = FrameStore::new(config.index, 1);
    store.set_mask(match &config.mask_image {
        Some(path) => Some(
            image::open(path)
                .with_context(|| format!("failed to load mask {}", path.display()))?
                .to_rgb8(),
        ),
        None => None,
    });

    let mut engine = DifferenceEngine::new(config.difference);
    engine.set_kernel(config.kernel.clone());
    if let Some(path) = &config.gain_image {
        let gain = image::open(path)
            .with_context(|| format!("failed to load gain {}", path.display()))?
            .to_rgb8();
        engine.set_gain(Some(gain));
    }

    let now = Local::now();
    let first = store.ingest_path(image1, now)?.dimensions();
    let second = store.ingest_path(image2, now)?.dimensions();

    // A size change clears the window, which leaves no pair to compare.
    if first != second {
        return Err(DetectorError::SizeMismatch {
            expected: first,
            found: second,
        }
        .into());
    }

    let (prev, curr) = store
        .last_pair()
        .ok_or_else(|| anyhow!("no image pair to compare"))?;

    let diff = engine.compute(prev, curr)?;

    let mut tracker = BaselineTracker::new(
        state.baseline,
        config.coefficients,
        config.avg_factor,
        config.sd_factor,
    );
    let baseline = tracker.update(diff.avg, diff.sd);
    let floor = tracker.floor();
    let level = tracker.level();

    if let Some(output) = output {
        let overlay = detection_overlay(prev.image(), curr.image(), &diff, floor)?;
        write_jpeg(output, &overlay, config.jpeg_quality)?;
    }

    Ok(CompareReport {
        width: diff.width,
        height: diff.height,
        avg: diff.avg,
        sd: diff.sd,
        raw_level: diff.raw_level,
        max_magnitude: diff.max_magnitude,
        diff_threshold: diff.threshold,
        baseline,
        floor,
        level,
        threshold: config.detection.threshold,
        detected: level >= config.detection.threshold,
    })
}
