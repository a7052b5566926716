//! # Frame retention
//!
//! Decoded captures and the short sliding window of them kept per source.

use crate::baseline::Baseline;
use crate::correction::CorrectionMap;
use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Local};
use image::RgbImage;
use log::*;
use nalgebra as na;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// RGB colour structure.
///
/// Layout matches the interleaved byte buffer of an [`RgbImage`], so a whole image can be viewed
/// as a slice of these without copying (see [`pixels`]).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RGB {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RGB {
    /// Channel values as a floating point vector.
    pub fn as_vector(&self) -> na::Vector3<f64> {
        na::Vector3::new(self.r as f64, self.g as f64, self.b as f64)
    }
}

/// View the pixel data of an image as `RGB` elements in row-major order.
pub fn pixels(image: &RgbImage) -> &[RGB] {
    let len = image.width() as usize * image.height() as usize * 3;
    bytemuck::cast_slice(&image.as_raw()[..len])
}

/// Statistics computed for a frame when it was compared against its predecessor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct FrameStats {
    pub avg: f64,
    pub sd: f64,
    /// Magnitude cut-off that selected the pixels contributing to `avg` and `sd`.
    pub diff_threshold: f64,
    pub level: f64,
    pub raw_level: f64,
    /// Baseline right after this frame was folded in.
    pub baseline: Baseline,
}

/// Files written for a saved frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedFiles {
    pub image: PathBuf,
    pub detection_image: Option<PathBuf>,
}

/// A single decoded capture.
pub struct Frame {
    image: RgbImage,
    image_number: u64,
    timestamp: DateTime<Local>,
    sequence: Option<u32>,
    saved: Option<SavedFiles>,
    logged: bool,
    stats: Option<FrameStats>,
    overlay: Option<RgbImage>,
}

impl Frame {
    /// Create a frame that has not been compared, saved or logged yet.
    pub fn new(image: RgbImage, image_number: u64, timestamp: DateTime<Local>) -> Self {
        Self {
            image,
            image_number,
            timestamp,
            sequence: None,
            saved: None,
            logged: false,
            stats: None,
            overlay: None,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image_number(&self) -> u64 {
        self.image_number
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Sequence group the frame was saved under.
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    pub fn is_saved(&self) -> bool {
        self.saved.is_some()
    }

    pub fn saved_files(&self) -> Option<&SavedFiles> {
        self.saved.as_ref()
    }

    pub fn is_logged(&self) -> bool {
        self.logged
    }

    pub fn stats(&self) -> Option<&FrameStats> {
        self.stats.as_ref()
    }

    /// Detection visualisation, if one was rendered.
    pub fn overlay(&self) -> Option<&RgbImage> {
        self.overlay.as_ref()
    }

    /// Attach comparison results.
    ///
    /// Results are computed once per frame; later calls are ignored.
    pub fn set_stats(&mut self, stats: FrameStats, overlay: Option<RgbImage>) {
        if self.stats.is_none() {
            self.stats = Some(stats);
            self.overlay = overlay;
        }
    }

    pub fn mark_saved(&mut self, sequence: u32, files: SavedFiles) {
        self.sequence = Some(sequence);
        self.saved = Some(files);
    }

    pub fn mark_logged(&mut self) {
        self.logged = true;
    }
}

/// Sliding window of the most recent frames of one source.
///
/// The window holds `max(2, predetection_images + 1)` frames at most. All retained frames share
/// the same dimensions; a frame of a different size clears the window before it is inserted.
pub struct FrameStore {
    index: usize,
    frames: VecDeque<Frame>,
    capacity: usize,
    next_image_number: u64,
    mask: Option<CorrectionMap>,
}

impl FrameStore {
    /// Create an empty store.
    ///
    /// # Arguments
    ///
    /// * `index` - source index, used to tag log records.
    /// * `predetection_images` - number of frames kept before the newest one.
    pub fn new(index: usize, predetection_images: usize) -> Self {
        let capacity = Self::window_bound(predetection_images);
        Self {
            index,
            frames: VecDeque::with_capacity(capacity + 1),
            capacity,
            next_image_number: 1,
            mask: None,
        }
    }

    fn window_bound(predetection_images: usize) -> usize {
        std::cmp::max(2, predetection_images + 1)
    }

    /// Change the amount of lead-up context retained, evicting frames if the window shrinks.
    pub fn set_predetection_images(&mut self, predetection_images: usize) {
        self.capacity = Self::window_bound(predetection_images);
        self.evict();
    }

    /// Set or remove the mask multiplied into every newly ingested frame.
    pub fn set_mask(&mut self, mask: Option<RgbImage>) {
        self.mask = mask.map(CorrectionMap::mask);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn get(&self, idx: usize) -> Option<&Frame> {
        self.frames.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Frame> {
        self.frames.get_mut(idx)
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn latest_mut(&mut self) -> Option<&mut Frame> {
        self.frames.back_mut()
    }

    /// The two most recent frames, oldest first.
    pub fn last_pair(&self) -> Option<(&Frame, &Frame)> {
        let n = self.frames.len();
        if n < 2 {
            None
        } else {
            Some((&self.frames[n - 2], &self.frames[n - 1]))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter()
    }

    /// Use up an image number for a capture that never made it into the window.
    ///
    /// The resulting gap in the numbering makes the next save open a new sequence.
    pub fn skip(&mut self) -> u64 {
        let image_number = self.next_image_number;
        self.next_image_number += 1;
        image_number
    }

    /// Decode an image file and insert it into the window.
    ///
    /// A decode failure leaves the window untouched but still uses up an image number.
    pub fn ingest_path(&mut self, path: &Path, timestamp: DateTime<Local>) -> Result<&Frame> {
        match image::open(path) {
            Ok(image) => Ok(self.push(image.to_rgb8(), timestamp)),
            Err(source) => {
                self.skip();
                Err(Error::Decode {
                    path: path.into(),
                    source,
                })
            }
        }
    }

    /// Decode an in-memory encoded image and insert it into the window.
    pub fn ingest_bytes(&mut self, bytes: &[u8], timestamp: DateTime<Local>) -> Result<&Frame> {
        match image::load_from_memory(bytes) {
            Ok(image) => Ok(self.push(image.to_rgb8(), timestamp)),
            Err(source) => {
                self.skip();
                Err(Error::Decode {
                    path: PathBuf::from("<memory>"),
                    source,
                })
            }
        }
    }

    /// Insert an already decoded image.
    ///
    /// Applies the mask, stamps the next image number and enforces the size and length
    /// invariants of the window. A size change skips a number, so the first frame at the new
    /// size never continues the sequence of the old one.
    pub fn push(&mut self, mut image: RgbImage, timestamp: DateTime<Local>) -> &Frame {
        if let Some(mask) = &mut self.mask {
            mask.apply(&mut image);
        }

        if let Some(last) = self.frames.back() {
            let (ow, oh) = last.dimensions();
            let (nw, nh) = image.dimensions();
            if (ow, oh) != (nw, nh) {
                warn!(
                    "[{}] Images are different sizes ({}x{} -> {}x{}), clearing {} retained frames",
                    self.index,
                    ow,
                    oh,
                    nw,
                    nh,
                    self.frames.len()
                );
                self.frames.clear();
                self.skip();
            }
        }

        let image_number = self.skip();

        self.frames
            .push_back(Frame::new(image, image_number, timestamp));
        self.evict();

        // Eviction never removes the frame that was just inserted.
        &self.frames[self.frames.len() - 1]
    }

    fn evict(&mut self) {
        while self.frames.len() > self.capacity {
            self.frames.pop_front();
        }
    }
}
