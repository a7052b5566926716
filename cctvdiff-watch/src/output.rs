//! # Saved images and the detection log

use crate::source_config::{SourceConfig, DEFAULT_DET_FILENAME, DEFAULT_FILENAME};
use anyhow::{Context, Result};
use cctvdiff::error::Error as DetectorError;
use cctvdiff::prelude::v1::{DetectionSettings, Frame, SavedFiles};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::*;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Expand an output pattern for a frame.
///
/// `{seqno}` becomes the zero padded sequence number, then the result is formatted as a `chrono`
/// strftime pattern against `timestamp`.
pub fn format_pattern(
    pattern: &str,
    seqno: u32,
    timestamp: &DateTime<Local>,
) -> Result<String, DetectorError> {
    let pattern = pattern.replace("{seqno}", &format!("{:09}", seqno));
    let mut out = String::new();
    write!(out, "{}", timestamp.format(&pattern))
        .map_err(|_| DetectorError::Config(format!("invalid date pattern '{}'", pattern)))?;
    Ok(out)
}

/// Writes the images of saved frames.
pub struct OutputSink {
    index: usize,
    image_dir: PathBuf,
    filename: String,
    det_image_dir: Option<PathBuf>,
    det_filename: String,
    quality: u8,
}

impl OutputSink {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            index: config.index,
            image_dir: config.image_dir.clone(),
            filename: config.filename.clone(),
            det_image_dir: config.det_image_dir.clone(),
            det_filename: config.det_filename.clone(),
            quality: config.jpeg_quality,
        }
    }

    /// Whether detection overlays are wanted at all.
    pub fn wants_overlay(&self) -> bool {
        self.det_image_dir.is_some()
    }

    fn path_for(
        &self,
        dir: &Path,
        pattern: &str,
        default: &str,
        seqno: u32,
        image_number: u64,
        timestamp: &DateTime<Local>,
    ) -> PathBuf {
        let number = format!("{:09}", image_number);
        let name = format_pattern(&pattern.replace("{number}", &number), seqno, timestamp)
            .unwrap_or_else(|e| {
                warn!("[{}] {}, using the default", self.index, e);
                let default = default.replace("{index}", &self.index.to_string());
                // The default pattern is always valid.
                format_pattern(&default, seqno, timestamp).unwrap_or_default()
            });
        dir.join(format!("{}.jpg", name))
    }

    /// # Arguments
    ///
    /// * `seqno` - substituted for `{seqno}`.
    /// * `image_number` - substituted for `{number}`.
    /// * `timestamp` - time the strftime fields are expanded against.
    pub fn image_path(
        &self,
        seqno: u32,
        image_number: u64,
        timestamp: &DateTime<Local>,
    ) -> PathBuf {
        self.path_for(
            &self.image_dir,
            &self.filename,
            DEFAULT_FILENAME,
            seqno,
            image_number,
            timestamp,
        )
    }

    pub fn detection_path(
        &self,
        seqno: u32,
        image_number: u64,
        timestamp: &DateTime<Local>,
    ) -> Option<PathBuf> {
        let dir = self.det_image_dir.as_ref()?;
        Some(self.path_for(
            dir,
            &self.det_filename,
            DEFAULT_DET_FILENAME,
            seqno,
            image_number,
            timestamp,
        ))
    }

    /// Save a frame, and its overlay if it has one, under sequence `seqno`.
    ///
    /// Existing files are never overwritten. Frames whose names collide, such as files copied
    /// into a source directory with the same modification time, get the image number appended.
    pub fn save(&self, frame: &Frame, seqno: u32) -> Result<SavedFiles> {
        let ts = frame.timestamp();
        let number = frame.image_number();

        let image = unused_path(self.image_path(seqno, number, &ts), number);
        write_jpeg(&image, frame.image(), self.quality)?;

        let detection_image = match (self.detection_path(seqno, number, &ts), frame.overlay()) {
            (Some(path), Some(overlay)) => {
                let path = unused_path(path, number);
                write_jpeg(&path, overlay, self.quality)?;
                Some(path)
            }
            _ => None,
        };

        debug!("[{}] Saved {}", self.index, image.display());

        Ok(SavedFiles {
            image,
            detection_image,
        })
    }
}

/// `path`, or `path` with `-<image_number>` added to its stem if that file already exists.
fn unused_path(path: PathBuf, image_number: u64) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}-{:09}.jpg", stem, image_number))
}

/// Encode `image` as JPEG, creating parent directories on demand.
pub fn write_jpeg(path: &Path, image: &RgbImage, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DetectorError::io(parent, e))?;
    }

    let file = fs::File::create(path).map_err(|e| DetectorError::io(path, e))?;
    let mut writer = BufWriter::new(file);

    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode_image(image)
        .with_context(|| format!("failed to encode {}", path.display()))?;

    writer.flush().map_err(|e| DetectorError::io(path, e))?;

    Ok(())
}

/// Tab separated log of frames at or above the log threshold.
pub struct DetectionLog {
    index: usize,
    pattern: String,
}

impl DetectionLog {
    /// `pattern` is a file path that may contain strftime fields, so logs can roll over by date.
    pub fn new(index: usize, pattern: impl Into<String>) -> Self {
        Self {
            index,
            pattern: pattern.into(),
        }
    }

    /// Append the line of `frame`, returning the log file written to.
    ///
    /// A blank line separates bursts, unless the file is still empty.
    pub fn append(
        &self,
        frame: &Frame,
        settings: &DetectionSettings,
        starts_burst: bool,
    ) -> Result<PathBuf> {
        let ts = frame.timestamp();
        let path = PathBuf::from(format_pattern(&self.pattern, 0, &ts)?);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| DetectorError::io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DetectorError::io(&path, e))?;

        let mut text = String::new();

        let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
        if starts_burst && !empty {
            text.push('\n');
        }

        text.push_str(&self.line(frame, settings));
        text.push('\n');

        file.write_all(text.as_bytes())
            .map_err(|e| DetectorError::io(&path, e))?;

        Ok(path)
    }

    fn line(&self, frame: &Frame, settings: &DetectionSettings) -> String {
        let stats = frame.stats().copied().unwrap_or_default();
        let b = stats.baseline;

        let (image, detection_image) = match frame.saved_files() {
            Some(files) => (
                files.image.display().to_string(),
                files
                    .detection_image
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into()),
            ),
            None => ("-".into(), "-".into()),
        };

        let fields = [
            frame.timestamp().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            self.index.to_string(),
            format!("{:.4}", stats.avg),
            format!("{:.4}", stats.sd),
            format!("{:.4}", b.fast_avg),
            format!("{:.4}", b.fast_sd),
            format!("{:.4}", b.slow_avg),
            format!("{:.4}", b.slow_sd),
            format!("{:.4}", stats.diff_threshold),
            format!("{:.4}", stats.level),
            format!("{:.4}", stats.raw_level),
            format!("{:.4}", settings.threshold),
            format!("{:.4}", settings.log_threshold),
            image,
            detection_image,
        ];

        fields.join("\t")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cctvdiff::prelude::v1::{Baseline, FrameStats};
    use chrono::TimeZone;
    use image::Rgb;

    fn timestamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(8, 8, Rgb([10, 200, 30])), 1, timestamp())
    }

    fn config(dir: &Path, det: bool) -> SourceConfig {
        let mut text = format!("imagedir={}/img\n", dir.display());
        if det {
            text.push_str(&format!("detimagedir={}/det\n", dir.display()));
        }
        SourceConfig::resolve(&crate::settings::KeyValueStore::parse(&text), 2)
    }

    #[test]
    fn pattern_expansion() {
        let ts = timestamp();
        assert_eq!(
            format_pattern("%Y%m%d-{seqno}", 42, &ts).unwrap(),
            "20240305-000000042"
        );
        assert_eq!(
            format_pattern("%Y-%m-%d/%H/2/Image-{seqno}-%H-%M-%S-%3f", 7, &ts).unwrap(),
            "2024-03-05/07/2/Image-000000007-07-08-09-000"
        );
        assert!(format_pattern("%Q", 0, &ts).is_err());
    }

    #[test]
    fn invalid_pattern_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::new(&config(dir.path(), false));
        sink.filename = "%Q".into();
        let path = sink.image_path(3, 1, &timestamp());
        assert_eq!(
            path,
            dir.path()
                .join("img/2024-03-05/07/2/Image-000000003-2024-03-05-07-08-09-000.jpg")
        );
    }

    #[test]
    fn unwritable_directory_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the image directory should be.
        fs::write(dir.path().join("img"), b"").unwrap();
        let sink = OutputSink::new(&config(dir.path(), false));

        let err = sink.save(&frame(), 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectorError>(),
            Some(DetectorError::Io { .. })
        ));
    }

    #[test]
    fn number_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = OutputSink::new(&config(dir.path(), false));
        sink.filename = "{seqno}-{number}".into();
        assert_eq!(
            sink.image_path(3, 17, &timestamp()),
            dir.path().join("img/000000003-000000017.jpg")
        );
    }

    #[test]
    fn colliding_names_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new(&config(dir.path(), false));

        let first = Frame::new(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])), 1, timestamp());
        let second = Frame::new(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])), 2, timestamp());

        let a = sink.save(&first, 5).unwrap().image;
        let b = sink.save(&second, 5).unwrap().image;
        assert_ne!(a, b);
        assert!(b
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-000000002.jpg"));

        let pixel = |p: &Path| image::open(p).unwrap().to_rgb8().get_pixel(0, 0)[0];
        assert!(pixel(&a) < 50);
        assert!(pixel(&b) > 200);
    }

    #[test]
    fn save_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new(&config(dir.path(), false));

        let files = sink.save(&frame(), 5).unwrap();
        assert!(files.detection_image.is_none());

        let decoded = image::open(&files.image).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 8));
    }

    #[test]
    fn save_writes_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::new(&config(dir.path(), true));
        assert!(sink.wants_overlay());

        let mut f = frame();
        f.set_stats(FrameStats::default(), Some(RgbImage::new(8, 8)));

        let files = sink.save(&f, 5).unwrap();
        let det = files.detection_image.unwrap();
        assert!(det.starts_with(dir.path().join("det")));
        assert!(det.exists());
    }

    #[test]
    fn log_groups_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/logs/det-%Y%m%d.log", dir.path().display());
        let log = DetectionLog::new(3, pattern);
        let settings = DetectionSettings::default();

        let mut f = frame();
        f.set_stats(
            FrameStats {
                avg: 1.5,
                level: 12.0,
                baseline: Baseline {
                    fast_avg: 2.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            None,
        );

        let path = log.append(&f, &settings, true).unwrap();
        log.append(&f, &settings, false).unwrap();
        log.append(&f, &settings, true).unwrap();

        assert_eq!(path, dir.path().join("logs/det-20240305.log"));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "");
        assert!(!text.starts_with('\n'));

        let fields: Vec<_> = lines[0].split('\t').collect();
        assert_eq!(fields.len(), 15);
        assert_eq!(fields[0], "2024-03-05 07:08:09.000");
        assert_eq!(fields[1], "3");
        assert_eq!(fields[2], "1.5000");
        assert_eq!(fields[4], "2.0000");
        assert_eq!(fields[9], "12.0000");
        assert_eq!(fields[11], "10.0000");
        assert_eq!(fields[13], "-");
        assert_eq!(fields[14], "-");
    }
}
