//! # Error taxonomy
//!
//! Every failure a source worker can hit while turning a capture into a decision. None of these
//! are fatal to the process: the worker reports them and carries on with the next tick.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Corrupt or unsupported image. The tick is skipped and the retention window is kept.
    #[error("failed to decode image '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Two frames with different dimensions were handed to the difference engine.
    #[error("frame size mismatch (expected {}x{}, found {}x{})", expected.0, expected.1, found.0, found.1)]
    SizeMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    /// Save or log file could not be written.
    #[error("i/o error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Missing or invalid configuration value or template.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
