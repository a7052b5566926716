//! # CCTV Difference Detection Library
//!
//! This library turns a stream of still images from a camera into motion detection decisions. It
//! provides a retention window of decoded frames, a corrected frame differencing engine, an
//! adaptive statistical baseline and the detection state machine that decides which frames to
//! keep.
//!
//! The easiest way to use the library is to import its prelude:
//!
//! ```
//! use cctvdiff::prelude::v1::*;
//! ```
//!
//! Capture, configuration and scheduling live in the `cctvdiff-watch` application, this crate only
//! deals with frames that are already on disk or in memory.

pub mod baseline;
pub mod correction;
pub mod detection;
pub mod difference;
pub mod error;
pub mod frame;
pub mod kernel;
pub mod overlay;

pub mod prelude {
    pub mod v1 {
        pub use crate::{
            baseline::{Baseline, BaselineCoefficients, BaselineState, BaselineTracker},
            correction::CorrectionMap,
            detection::{
                Decision, DetectionSettings, DetectionState, DetectionStateMachine, LogEntry,
                SequenceTracker, Transition, SEQNO_MODULUS,
            },
            difference::{DifferenceEngine, DifferenceResult, DifferenceSettings},
            error::Error as DetectorError,
            frame::{Frame, FrameStats, FrameStore, SavedFiles, RGB},
            kernel::ConvolutionKernel,
            overlay::detection_overlay,
        };
        pub use anyhow::{anyhow, Error, Result};
    }
}
