//! # Capture collaborators
//!
//! A [`FrameSource`] hands the worker one image file per tick. Sources are either external
//! commands run through `sh -c`, or a directory of pre-recorded images.

use crate::source_config::{CaptureMethod, SourceConfig};
use chrono::{DateTime, Local};
use log::*;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("command '{command}' failed with {status}")]
    Failed { command: String, status: ExitStatus },
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to run command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("source directory exhausted")]
    Exhausted,
    #[error("no capture method configured")]
    NotConfigured,
}

/// A single captured image file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capture {
    pub path: PathBuf,
    pub timestamp: DateTime<Local>,
}

pub trait FrameSource: Send {
    /// Produce the next image.
    fn capture(&mut self) -> Result<Capture, CaptureError>;

    /// Release whatever the source left on disk.
    fn cleanup(&mut self) {}
}

/// Create the frame source described by `config`.
pub fn create_source(config: &SourceConfig) -> Box<dyn FrameSource> {
    match &config.capture {
        CaptureMethod::Command(template) => {
            let source = CommandSource::new(template, &config.temp_file, config.capture_timeout);
            debug!("[{}] Capturing with '{}'", config.index, source.command());
            Box::new(source)
        }
        CaptureMethod::Directory(dir) => match DirectorySource::scan(dir) {
            Ok(source) => {
                info!(
                    "[{}] {} images queued from {}",
                    config.index,
                    source.remaining(),
                    dir.display()
                );
                Box::new(source)
            }
            Err(e) => {
                error!("[{}] Failed to list {}: {}", config.index, dir.display(), e);
                Box::new(DirectorySource::default())
            }
        },
        CaptureMethod::None => Box::new(NoSource),
    }
}

/// Runs a shell command that writes the image to a temporary file.
pub struct CommandSource {
    command: String,
    temp_file: PathBuf,
    timeout: Duration,
}

impl CommandSource {
    /// # Arguments
    ///
    /// * `template` - shell command, `{file}` is replaced with `temp_file`.
    /// * `temp_file` - where the command is expected to put the image.
    /// * `timeout` - hard limit after which the command is killed.
    pub fn new(template: &str, temp_file: &Path, timeout: Duration) -> Self {
        Self {
            command: template.replace("{file}", &temp_file.to_string_lossy()),
            temp_file: temp_file.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl FrameSource for CommandSource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        // A stale image from the last tick must not pass as a fresh capture.
        let _ = fs::remove_file(&self.temp_file);

        let status = run_with_timeout(&self.command, self.timeout)?;

        if status.success() {
            Ok(Capture {
                path: self.temp_file.clone(),
                timestamp: Local::now(),
            })
        } else {
            Err(CaptureError::Failed {
                command: self.command.clone(),
                status,
            })
        }
    }

    fn cleanup(&mut self) {
        let _ = fs::remove_file(&self.temp_file);
    }
}

/// Run `command` through `sh -c`, killing it once `timeout` elapses.
///
/// A timeout too long to represent as a deadline never fires.
pub fn run_with_timeout(command: &str, timeout: Duration) -> Result<ExitStatus, CaptureError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| CaptureError::Spawn {
            command: command.into(),
            source,
        })?;

    let deadline = Instant::now().checked_add(timeout);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if deadline.map_or(false, |d| Instant::now() >= d) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Timeout {
                    command: command.into(),
                    timeout,
                });
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(CaptureError::Spawn {
                    command: command.into(),
                    source,
                });
            }
        }
    }
}

/// Pops pre-recorded images off a list, oldest first.
#[derive(Default)]
pub struct DirectorySource {
    files: VecDeque<(SystemTime, PathBuf)>,
}

impl DirectorySource {
    /// List every image in `dir`, ordered by modification time and then name.
    pub fn scan(dir: &Path) -> io::Result<Self> {
        let mut files = vec![];

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if !is_image_file(&path) {
                continue;
            }

            let meta = entry.metadata()?;
            if meta.is_file() {
                files.push((meta.modified()?, path));
            }
        }

        files.sort();

        Ok(Self {
            files: files.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

impl FrameSource for DirectorySource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        let (modified, path) = self.files.pop_front().ok_or(CaptureError::Exhausted)?;
        Ok(Capture {
            path,
            timestamp: modified.into(),
        })
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// Source of an unconfigured camera.
pub struct NoSource;

impl FrameSource for NoSource {
    fn capture(&mut self) -> Result<Capture, CaptureError> {
        Err(CaptureError::NotConfigured)
    }
}
