//! # Detection state machine
//!
//! Turns per-frame levels into detection decisions: which frames to save, whether to log, and
//! which external actions to fire.

use std::ops::Range;

/// Sequence numbers wrap at this value.
pub const SEQNO_MODULUS: u32 = 1_000_000_000;

/// Current phase of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum DetectionState {
    /// No recent detections.
    Idle,
    /// Level is at or above the threshold.
    Detecting,
    /// Level dropped, but post-detection frames are still being saved.
    Cooling,
}

/// Edge or steady-state event that may trigger an external action.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    /// First detecting frame of a run.
    DetectionStart { level: f64 },
    /// Every detecting frame; `detcount` counts from 1 within the run.
    Detection { level: f64, detcount: u32 },
    /// First frame below threshold after a run of `detcount` detecting frames.
    DetectionEnd { level: f64, detcount: u32 },
    /// Every frame below threshold.
    NoDetection { level: f64 },
}

impl Transition {
    pub fn level(&self) -> f64 {
        match *self {
            Self::DetectionStart { level }
            | Self::Detection { level, .. }
            | Self::DetectionEnd { level, .. }
            | Self::NoDetection { level } => level,
        }
    }

    pub fn detcount(&self) -> u32 {
        match *self {
            Self::Detection { detcount, .. } | Self::DetectionEnd { detcount, .. } => detcount,
            _ => 0,
        }
    }
}

/// Tunables of the state machine.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct DetectionSettings {
    /// Level at which a frame counts as a detection.
    pub threshold: f64,
    /// Level at which a frame is written to the detection log.
    pub log_threshold: f64,
    /// Frames before a detection that get saved with it.
    pub predetection_images: usize,
    /// Frames after a detection that are saved regardless of level.
    pub postdetection_images: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            threshold: 10.0,
            log_threshold: 10.0,
            predetection_images: 2,
            postdetection_images: 2,
        }
    }
}

/// Detection log instruction for the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// The previous frame was not logged, so this line starts a new burst.
    pub starts_burst: bool,
}

/// Outcome of [`DetectionStateMachine::decide`].
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub state: DetectionState,
    /// Window positions whose unsaved frames should be saved, oldest first.
    pub save: Option<Range<usize>>,
    pub log: Option<LogEntry>,
    pub transitions: Vec<Transition>,
}

/// Per-source detection session.
pub struct DetectionStateMachine {
    settings: DetectionSettings,
    detcount: u32,
    forcesavecount: usize,
    last_logged: bool,
}

impl DetectionStateMachine {
    pub fn new(settings: DetectionSettings) -> Self {
        Self {
            settings,
            detcount: 0,
            forcesavecount: 0,
            last_logged: false,
        }
    }

    /// Replace tunables. A detection run in progress carries on under the new settings.
    pub fn reconfigure(&mut self, settings: DetectionSettings) {
        self.settings = settings;
        self.forcesavecount = self.forcesavecount.min(settings.postdetection_images);
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn detcount(&self) -> u32 {
        self.detcount
    }

    pub fn forcesavecount(&self) -> usize {
        self.forcesavecount
    }

    pub fn state(&self) -> DetectionState {
        if self.detcount > 0 {
            DetectionState::Detecting
        } else if self.forcesavecount > 0 {
            DetectionState::Cooling
        } else {
            DetectionState::Idle
        }
    }

    /// Decide what to do with the newest frame.
    ///
    /// # Arguments
    ///
    /// * `level` - detection level of the newest frame.
    /// * `window_len` - number of frames currently retained, the newest one being last.
    pub fn decide(&mut self, level: f64, window_len: usize) -> Decision {
        let s = self.settings;
        let detecting = level >= s.threshold;

        let save = if detecting || self.forcesavecount > 0 {
            Some(window_len.saturating_sub(s.predetection_images + 1)..window_len)
        } else {
            None
        };

        if detecting {
            self.forcesavecount = s.postdetection_images;
        } else if self.forcesavecount > 0 {
            self.forcesavecount -= 1;
        }

        let mut transitions = vec![];

        if detecting {
            if self.detcount == 0 {
                transitions.push(Transition::DetectionStart { level });
            }
            self.detcount += 1;
            transitions.push(Transition::Detection {
                level,
                detcount: self.detcount,
            });
        } else {
            if self.detcount > 0 {
                transitions.push(Transition::DetectionEnd {
                    level,
                    detcount: self.detcount,
                });
            }
            self.detcount = 0;
            transitions.push(Transition::NoDetection { level });
        }

        let log = if level >= s.log_threshold {
            let entry = LogEntry {
                starts_burst: !self.last_logged,
            };
            self.last_logged = true;
            Some(entry)
        } else {
            self.last_logged = false;
            None
        };

        Decision {
            state: self.state(),
            save,
            log,
            transitions,
        }
    }
}

/// Groups saved frames into numbered sequences.
///
/// Frames whose image numbers follow on directly from the last saved one belong to the same
/// sequence. Any gap, or a restart of the numbering, opens a new sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    seqno: u32,
    last_saved: u64,
}

impl SequenceTracker {
    pub fn new(seqno: u32, last_saved: u64) -> Self {
        Self {
            seqno: seqno % SEQNO_MODULUS,
            last_saved,
        }
    }

    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    pub fn last_saved(&self) -> u64 {
        self.last_saved
    }

    /// Sequence number a frame with `image_number` would be saved under.
    pub fn peek(&self, image_number: u64) -> u32 {
        if image_number == self.last_saved + 1 {
            self.seqno
        } else {
            (self.seqno + 1) % SEQNO_MODULUS
        }
    }

    /// Record a successful save, returning the sequence number used.
    pub fn commit(&mut self, image_number: u64) -> u32 {
        self.seqno = self.peek(image_number);
        self.last_saved = image_number;
        self.seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: f64 = 100.0;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            threshold: T,
            log_threshold: T,
            predetection_images: 2,
            postdetection_images: 2,
        }
    }

    /// Feed `levels` through the machine with a window that fills up to its bound, returning the
    /// decisions and which frames ended up saved.
    fn run(levels: &[f64], settings: DetectionSettings) -> (Vec<Decision>, Vec<bool>) {
        let bound = std::cmp::max(2, settings.predetection_images + 1);
        let mut sm = DetectionStateMachine::new(settings);
        let mut saved = vec![false; levels.len()];
        let mut decisions = vec![];

        for (i, &level) in levels.iter().enumerate() {
            let first = (i + 1).saturating_sub(bound);
            let window_len = i + 1 - first;
            let d = sm.decide(level, window_len);
            if let Some(range) = &d.save {
                for w in range.clone() {
                    saved[first + w] = true;
                }
            }
            decisions.push(d);
        }

        (decisions, saved)
    }

    fn count(decisions: &[Decision], pred: impl Fn(&Transition) -> bool) -> Vec<usize> {
        decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.transitions.iter().any(&pred))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn burst_lifecycle() {
        let levels = [0.0, 0.0, T + 1.0, T + 1.0, T - 1.0, 0.0, 0.0];
        let (decisions, saved) = run(&levels, settings());

        let starts = count(&decisions, |t| matches!(t, Transition::DetectionStart { .. }));
        let ends = count(&decisions, |t| matches!(t, Transition::DetectionEnd { .. }));
        assert_eq!(starts, vec![2]);
        assert_eq!(ends, vec![4]);

        // 2 lead-up frames, 2 detecting frames, 2 post-detection frames.
        assert_eq!(saved, vec![true, true, true, true, true, true, false]);

        let states: Vec<_> = decisions.iter().map(|d| d.state).collect();
        use DetectionState::*;
        assert_eq!(
            states,
            vec![Idle, Idle, Detecting, Detecting, Cooling, Idle, Idle]
        );
    }

    #[test]
    fn lead_up_is_bounded_by_window() {
        // Detection on the second frame only has one frame of lead-up available.
        let (_, saved) = run(&[0.0, T, 0.0, 0.0, 0.0], settings());
        assert_eq!(saved, vec![true, true, true, true, false]);
    }

    #[test]
    fn detection_counts_and_commands() {
        let mut sm = DetectionStateMachine::new(settings());
        let d = sm.decide(T, 3);
        assert_eq!(
            d.transitions,
            vec![
                Transition::DetectionStart { level: T },
                Transition::Detection {
                    level: T,
                    detcount: 1
                }
            ]
        );
        let d = sm.decide(T * 2.0, 3);
        assert_eq!(
            d.transitions,
            vec![Transition::Detection {
                level: T * 2.0,
                detcount: 2
            }]
        );
        let d = sm.decide(0.0, 3);
        assert_eq!(
            d.transitions,
            vec![
                Transition::DetectionEnd {
                    level: 0.0,
                    detcount: 2
                },
                Transition::NoDetection { level: 0.0 }
            ]
        );
        assert_eq!(sm.detcount(), 0);
        let d = sm.decide(0.0, 3);
        assert_eq!(d.transitions, vec![Transition::NoDetection { level: 0.0 }]);
    }

    #[test]
    fn redetection_during_cooling_restarts_run() {
        let mut sm = DetectionStateMachine::new(settings());
        sm.decide(T, 3);
        sm.decide(0.0, 3);
        assert_eq!(sm.state(), DetectionState::Cooling);
        let d = sm.decide(T, 3);
        assert!(d
            .transitions
            .contains(&Transition::DetectionStart { level: T }));
        assert_eq!(sm.forcesavecount(), 2);
    }

    #[test]
    fn log_bursts() {
        let mut s = settings();
        s.log_threshold = 50.0;
        let mut sm = DetectionStateMachine::new(s);

        let logs: Vec<_> = [60.0, 70.0, 10.0, 80.0, 0.0]
            .iter()
            .map(|&l| sm.decide(l, 3).log)
            .collect();

        assert_eq!(
            logs,
            vec![
                Some(LogEntry { starts_burst: true }),
                Some(LogEntry {
                    starts_burst: false
                }),
                None,
                Some(LogEntry { starts_burst: true }),
                None,
            ]
        );
    }

    #[test]
    fn log_threshold_below_save_threshold() {
        let mut s = settings();
        s.log_threshold = 10.0;
        let mut sm = DetectionStateMachine::new(s);
        let d = sm.decide(20.0, 3);
        assert!(d.log.is_some());
        assert!(d.save.is_none());
        assert_eq!(d.state, DetectionState::Idle);
    }

    #[test]
    fn sequence_increments_on_gap() {
        let mut seq = SequenceTracker::new(0, 0);
        let seqs: Vec<_> = [1, 2, 3, 7, 8].iter().map(|&n| seq.commit(n)).collect();
        assert_eq!(seqs, vec![0, 0, 0, 1, 1]);
        assert_eq!(seq.last_saved(), 8);
    }

    #[test]
    fn sequence_restart_opens_new_group() {
        // Numbering restarts from 1 after a process restart.
        let mut seq = SequenceTracker::new(41, 5000);
        assert_eq!(seq.peek(1), 42);
        assert_eq!(seq.seqno(), 41);
        assert_eq!(seq.commit(1), 42);
        assert_eq!(seq.commit(2), 42);
    }

    #[test]
    fn sequence_wraps() {
        let mut seq = SequenceTracker::new(SEQNO_MODULUS - 1, 0);
        assert_eq!(seq.commit(10), 0);
    }
}
