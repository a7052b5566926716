//! # Source worker
//!
//! One polling loop per camera. Every tick captures an image, compares it against the previous
//! one, updates the baseline and acts on the detection decision. Workers only meet at the
//! [`PersistenceBridge`].

use crate::actions::ActionRunner;
use crate::bridge::{PersistenceBridge, StatsRecord};
use crate::capture::{create_source, Capture, CaptureError, FrameSource};
use crate::output::{DetectionLog, OutputSink};
use crate::source_config::{CaptureMethod, SourceConfig};
use crate::timer::Cadence;
use anyhow::Result;
use cctvdiff::prelude::v1::*;
use image::RgbImage;
use log::*;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

pub struct SourceWorker {
    index: usize,
    bridge: Arc<PersistenceBridge>,
    config: SourceConfig,
    generation: u64,
    store: FrameStore,
    engine: DifferenceEngine,
    baseline: BaselineTracker,
    detector: DetectionStateMachine,
    sequence: SequenceTracker,
    actions: ActionRunner,
    output: OutputSink,
    det_log: Option<DetectionLog>,
    source: Box<dyn FrameSource>,
    cadence: Cadence,
    ticks: u64,
}

impl SourceWorker {
    /// Create the worker of source `index`, restoring its persisted state.
    pub fn new(index: usize, bridge: Arc<PersistenceBridge>) -> Self {
        let generation = bridge.generation();
        let config = bridge.source_config(index);
        let state = bridge.load_state(index);

        let mut worker = Self {
            index,
            config: config.clone(),
            generation,
            store: FrameStore::new(index, config.detection.predetection_images),
            engine: DifferenceEngine::new(config.difference),
            baseline: BaselineTracker::new(
                state.baseline,
                config.coefficients,
                config.avg_factor,
                config.sd_factor,
            ),
            detector: DetectionStateMachine::new(config.detection),
            sequence: SequenceTracker::new(state.seqno, state.last_saved),
            actions: ActionRunner::new(index, config.actions.clone(), config.action_timeout),
            output: OutputSink::new(&config),
            det_log: None,
            source: create_source(&config),
            cadence: Cadence::new(config.period),
            ticks: 0,
            bridge,
        };

        worker.apply(&config);

        if config.capture == CaptureMethod::None {
            warn!("[{}] No capture method configured", index);
        }

        worker
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn store(&self) -> &FrameStore {
        &self.store
    }

    /// Apply a freshly resolved configuration.
    ///
    /// The frame window, baseline and detection counters survive. The capture source is only
    /// recreated when its method changed, so a directory source keeps its position.
    pub fn configure(&mut self, config: SourceConfig) {
        if config.capture != self.config.capture {
            self.source.cleanup();
            self.source = create_source(&config);
            if config.capture == CaptureMethod::None {
                warn!("[{}] No capture method configured", self.index);
            }
        }

        self.apply(&config);
        self.config = config;

        info!("[{}] Reconfigured (generation {})", self.index, self.generation);
    }

    fn apply(&mut self, config: &SourceConfig) {
        self.store
            .set_predetection_images(config.detection.predetection_images);
        self.store
            .set_mask(load_correction(self.index, "mask", config.mask_image.as_deref()));

        self.engine.set_settings(config.difference);
        self.engine.set_kernel(config.kernel.clone());
        self.engine
            .set_gain(load_correction(self.index, "gain", config.gain_image.as_deref()));

        self.baseline
            .reconfigure(config.coefficients, config.avg_factor, config.sd_factor);
        self.detector.reconfigure(config.detection);
        self.actions
            .set_templates(config.actions.clone(), config.action_timeout);
        self.output = OutputSink::new(config);
        self.det_log = config
            .det_log
            .as_ref()
            .map(|pattern| DetectionLog::new(self.index, pattern.clone()));
        self.cadence.set_period(config.period);
    }

    /// Run a single iteration of the polling loop.
    ///
    /// Breaks once the capture source is exhausted.
    pub fn tick(&mut self) -> ControlFlow<()> {
        let lag = self.cadence.lag();
        if self.cadence.is_lagging(lag) {
            warn!(
                "[{}] Running {:.3}s behind schedule",
                self.index,
                lag.as_secs_f64()
            );
        }
        self.bridge.record_lag(self.index, lag);
        self.cadence.advance();

        let capture_now = self.ticks % self.config.subsample == 0;
        self.ticks += 1;

        if capture_now {
            match self.source.capture() {
                Ok(capture) => {
                    if let Err(e) = self.process(capture) {
                        error!("[{}] {}", self.index, e);
                    }
                }
                Err(CaptureError::Exhausted) => {
                    info!("[{}] No more images to process", self.index);
                    return ControlFlow::Break(());
                }
                // Already reported when the source was configured.
                Err(CaptureError::NotConfigured) => {}
                Err(e) => {
                    // A missed capture splits the sequence like a missed decode does.
                    self.store.skip();
                    error!("[{}] {}", self.index, e);
                }
            }
        }

        let bridge = self.bridge.clone();
        self.cadence.sleep(|| bridge.is_shutdown());

        if self.index == 1 {
            self.bridge.check_for_changes();
        }

        let generation = self.bridge.generation();
        if generation != self.generation {
            self.generation = generation;
            let config = self.bridge.source_config(self.index);
            self.configure(config);
            self.cadence.resync();
        }

        ControlFlow::Continue(())
    }

    /// Push a captured image through the detection pipeline.
    ///
    /// Returns `None` when there is nothing to compare the image against yet.
    pub fn process(&mut self, capture: Capture) -> Result<Option<Decision>> {
        self.store.ingest_path(&capture.path, capture.timestamp)?;

        let (diff, overlay) = match self.store.last_pair() {
            Some((prev, curr)) => {
                let diff = self.engine.compute(prev, curr)?;
                self.baseline.update(diff.avg, diff.sd);

                let overlay = if self.output.wants_overlay() {
                    Some(detection_overlay(
                        prev.image(),
                        curr.image(),
                        &diff,
                        self.baseline.floor(),
                    )?)
                } else {
                    None
                };

                (diff, overlay)
            }
            None => return Ok(None),
        };

        let level = self.baseline.level();
        let stats = FrameStats {
            avg: diff.avg,
            sd: diff.sd,
            diff_threshold: diff.threshold,
            level,
            raw_level: diff.raw_level,
            baseline: self.baseline.baseline(),
        };

        let image_number = match self.store.latest_mut() {
            Some(frame) => {
                frame.set_stats(stats, overlay);
                frame.image_number()
            }
            None => return Ok(None),
        };

        if self.config.verbose {
            info!(
                "[{}] #{} level {:.4} avg {:.4} sd {:.4}",
                self.index, image_number, level, diff.avg, diff.sd
            );
        } else {
            debug!(
                "[{}] #{} level {:.4} avg {:.4} sd {:.4}",
                self.index, image_number, level, diff.avg, diff.sd
            );
        }

        let decision = self.detector.decide(level, self.store.len());

        if let Some(range) = decision.save.clone() {
            self.save_range(range);
        }

        if let Some(entry) = decision.log {
            self.log_latest(entry);
        }

        // Detach, a slow command must not hold up the loop.
        drop(self.actions.run(&decision.transitions));

        self.bridge.record(
            self.index,
            &StatsRecord {
                state: BaselineState {
                    baseline: self.baseline.baseline(),
                    seqno: self.sequence.seqno(),
                    last_saved: self.sequence.last_saved(),
                },
                level,
                raw_level: diff.raw_level,
            },
        );

        Ok(Some(decision))
    }

    fn save_range(&mut self, range: std::ops::Range<usize>) {
        for i in range {
            let (number, result) = match self.store.get(i) {
                Some(frame) if !frame.is_saved() => {
                    let seqno = self.sequence.peek(frame.image_number());
                    (frame.image_number(), self.output.save(frame, seqno))
                }
                _ => continue,
            };

            match result {
                Ok(files) => {
                    let seqno = self.sequence.commit(number);
                    if let Some(frame) = self.store.get_mut(i) {
                        frame.mark_saved(seqno, files);
                    }
                }
                // The frame stays unsaved and is retried while it is in the window.
                Err(e) => error!("[{}] Failed to save image #{}: {:#}", self.index, number, e),
            }
        }
    }

    fn log_latest(&mut self, entry: LogEntry) {
        let log = match &self.det_log {
            Some(log) => log,
            None => return,
        };

        let settings = *self.detector.settings();

        if let Some(frame) = self.store.latest_mut() {
            match log.append(frame, &settings, entry.starts_burst) {
                Ok(_) => frame.mark_logged(),
                Err(e) => error!("[{}] Failed to write detection log: {:#}", self.index, e),
            }
        }
    }

    /// Tick until shutdown is requested or the source runs dry.
    pub fn run(mut self) {
        info!("[{}] Worker started ({})", self.index, self.config.name);

        while !self.bridge.is_shutdown() {
            if self.tick().is_break() {
                break;
            }
        }

        self.source.cleanup();

        info!("[{}] Worker stopped", self.index);
    }
}

fn load_correction(index: usize, kind: &str, path: Option<&Path>) -> Option<RgbImage> {
    let path = path?;
    match image::open(path) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            warn!(
                "[{}] Ignoring {} image {}: {}",
                index,
                kind,
                path.display(),
                e
            );
            None
        }
    }
}

/// Running worker thread. Dropping the handle waits for the thread to finish.
pub struct WorkerHandle {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn join(mut self) {
        self.wait();
    }

    fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[{}] Worker panicked", self.index);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.wait();
    }
}

/// Start the worker of source `index` on its own thread.
pub fn spawn(index: usize, bridge: Arc<PersistenceBridge>) -> Result<WorkerHandle> {
    // Counted before the thread starts, so the main loop never sees a spurious zero.
    let live = bridge.worker_started();

    let handle = Builder::new()
        .name(format!("source-{}", index))
        .spawn(move || {
            let _live = live;
            SourceWorker::new(index, bridge).run();
        })?;

    Ok(WorkerHandle {
        index,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::KeyValueStore;
    use image::Rgb;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    fn scene(change: Option<(u32, u32)>) -> RgbImage {
        let mut img = RgbImage::from_pixel(16, 12, Rgb([90, 90, 90]));
        if let Some((x, y)) = change {
            for dy in 0..3 {
                for dx in 0..3 {
                    img.put_pixel(x + dx, y + dy, Rgb([250, 250, 250]));
                }
            }
        }
        img
    }

    fn bridge(config: String) -> Arc<PersistenceBridge> {
        Arc::new(PersistenceBridge::new(
            KeyValueStore::parse(&config),
            KeyValueStore::parse(""),
        ))
    }

    fn saved_images(dir: &Path) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut out = vec![];
        if dir.exists() {
            walk(dir, &mut out);
        }
        out.sort();
        out
    }

    /// Three quiet frames, two with an object moving about, then quiet again.
    fn frames() -> Vec<RgbImage> {
        vec![
            scene(None),
            scene(None),
            scene(None),
            scene(Some((2, 2))),
            scene(Some((9, 6))),
            scene(None),
            scene(None),
            scene(None),
            scene(None),
        ]
    }

    fn config(dir: &Path, extra: &str) -> String {
        format!(
            "sourcedir={src}\nimagedir={out}/images\nperiod=0\nthreshold=1\n\
             predetectionimages=1\npostdetectionimages=1\nfilename={{seqno}}-%H%M%S%.f\n{}",
            extra,
            src = dir.join("src").display(),
            out = dir.display(),
        )
    }

    fn write_frames(dir: &Path) {
        let src = dir.join("src");
        fs::create_dir_all(&src).unwrap();
        for (i, img) in frames().iter().enumerate() {
            img.save(src.join(format!("{:03}.png", i))).unwrap();
        }
    }

    #[test]
    fn processes_directory_to_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        // Instant fast filter, so the level drops as soon as the scene is quiet again.
        let bridge = bridge(config(
            dir.path(),
            &format!(
                "fastattcoeff=1\nfastdecaycoeff=1\ndetlog={}/det.log\n",
                dir.path().display()
            ),
        ));
        let mut worker = SourceWorker::new(2, bridge.clone());

        let mut ticks = 0;
        while worker.tick().is_continue() {
            ticks += 1;
            assert!(ticks < 100);
        }
        assert_eq!(ticks, frames().len());

        // Frames 4 to 6 differ from their predecessor. Frame 3 is saved as lead-up and frame 7
        // as the single post-detection image, all in one sequence.
        let images = saved_images(&dir.path().join("images"));
        assert!(!images.is_empty());
        assert!(images
            .iter()
            .all(|p| p.file_name().unwrap().to_string_lossy().starts_with("000000001-")));

        let log = fs::read_to_string(dir.path().join("det.log")).unwrap();
        assert_eq!(log.lines().count(), 3, "{}", log);

        let state = bridge.load_state(2);
        assert_eq!(state.seqno, 1);
        assert_eq!(state.last_saved, 7);
        assert_eq!(state.baseline.fast_avg, 0.0);
        assert_eq!(state.baseline.slow_avg, 0.0);
    }

    #[test]
    fn first_frame_has_nothing_to_compare() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        scene(None).save(&path).unwrap();

        let bridge = bridge("imagedir=/nonexistent\n".into());
        let mut worker = SourceWorker::new(1, bridge);

        let capture = Capture {
            path: path.clone(),
            timestamp: chrono::Local::now(),
        };
        assert!(worker.process(capture.clone()).unwrap().is_none());

        let decision = worker.process(capture).unwrap().unwrap();
        assert_eq!(decision.state, DetectionState::Idle);
        assert!(decision.save.is_none());
        assert_eq!(worker.store().len(), 2);
    }

    #[test]
    fn decode_failure_keeps_window() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.png");
        let bad = dir.path().join("b.jpg");
        scene(None).save(&good).unwrap();
        fs::write(&bad, b"not an image").unwrap();

        let mut worker = SourceWorker::new(1, bridge(String::new()));
        let now = chrono::Local::now();

        worker
            .process(Capture {
                path: good,
                timestamp: now,
            })
            .unwrap();
        assert!(worker
            .process(Capture {
                path: bad,
                timestamp: now,
            })
            .is_err());
        assert_eq!(worker.store().len(), 1);
    }

    #[test]
    fn decode_failure_between_saves_opens_new_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let quiet = dir.path().join("quiet.png");
        let busy = dir.path().join("busy.png");
        let bad = dir.path().join("bad.jpg");
        scene(None).save(&quiet).unwrap();
        scene(Some((4, 4))).save(&busy).unwrap();
        fs::write(&bad, b"not an image").unwrap();

        let bridge = bridge(format!(
            "imagedir={}/images\nthreshold=1\nfastattcoeff=1\nfastdecaycoeff=1\n\
             predetectionimages=0\npostdetectionimages=0\n",
            dir.path().display()
        ));
        let mut worker = SourceWorker::new(1, bridge);
        let now = chrono::Local::now();
        let capture = |path: &Path| Capture {
            path: path.into(),
            timestamp: now,
        };

        worker.process(capture(&quiet)).unwrap();
        worker.process(capture(&busy)).unwrap();
        let first = worker.store().latest().and_then(Frame::sequence);
        assert!(first.is_some());

        assert!(worker.process(capture(&bad)).is_err());
        worker.process(capture(&quiet)).unwrap();
        let second = worker.store().latest().and_then(Frame::sequence);
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn failed_capture_uses_up_an_image_number() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.png");
        scene(None).save(&good).unwrap();

        let mut worker = SourceWorker::new(1, bridge("capturecmd=exit 1\nperiod=0\n".into()));
        assert!(worker.tick().is_continue());
        assert!(worker.store().is_empty());

        worker
            .process(Capture {
                path: good,
                timestamp: chrono::Local::now(),
            })
            .unwrap();
        assert_eq!(worker.store().latest().map(|f| f.image_number()), Some(2));
    }

    #[test]
    fn subsample_skips_captures() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let bridge = bridge(config(dir.path(), "subsample=3\nthreshold=1000000\n"));
        let mut worker = SourceWorker::new(1, bridge);

        for _ in 0..6 {
            assert!(worker.tick().is_continue());
        }
        // Ticks 0 and 3 captured.
        assert_eq!(worker.store().len(), 2);
        assert_eq!(worker.store().latest().map(|f| f.image_number()), Some(2));
    }

    #[test]
    fn reconfigures_on_generation_change() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("cctvdiff.conf");
        fs::write(&conf, "threshold=10\nperiod=0\n").unwrap();

        let bridge = Arc::new(PersistenceBridge::new(
            KeyValueStore::open(&conf).unwrap(),
            KeyValueStore::parse(""),
        ));

        let mut worker = SourceWorker::new(1, bridge.clone());
        assert!(worker.tick().is_continue());
        assert_eq!(worker.config().detection.threshold, 10.0);

        std::thread::sleep(Duration::from_millis(1100));
        fs::write(&conf, "threshold=25\nperiod=0\n").unwrap();

        // Source 1 polls the file itself.
        assert!(worker.tick().is_continue());
        assert_eq!(bridge.generation(), 1);
        assert_eq!(worker.config().detection.threshold, 25.0);
    }

    #[test]
    fn spawned_workers_finish_and_count_down() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let bridge = bridge(config(dir.path(), ""));
        let handle = spawn(1, bridge.clone()).unwrap();
        assert_eq!(handle.index(), 1);
        handle.join();

        assert_eq!(bridge.live_workers(), 0);
        assert_eq!(bridge.load_state(1).seqno, 1);
    }
}
