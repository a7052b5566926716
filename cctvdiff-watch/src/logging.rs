//! # Log sink setup
//!
//! Records go to stderr, or to one file per local day when a log directory is configured.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use env_logger::{Builder, Env, Target, WriteStyle};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Append-only writer that switches to a new file on the first write of each day.
pub struct DailyLogFile {
    dir: PathBuf,
    current: Option<(NaiveDate, File)>,
}

impl DailyLogFile {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self { dir, current: None })
    }

    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("cctvdiff-{}.log", day.format("%Y-%m-%d")))
    }

    fn file(&mut self, day: NaiveDate) -> io::Result<&mut File> {
        let stale = !matches!(&self.current, Some((d, _)) if *d == day);

        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(day))?;
            self.current = Some((day, file));
        }

        match &mut self.current {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file not open")),
        }
    }
}

impl Write for DailyLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let today = Local::now().date_naive();
        self.file(today)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.current {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Initialise the global logger. The default filter is `info`, `RUST_LOG` overrides it.
pub fn init(log_location: Option<&Path>) -> Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if let Some(dir) = log_location {
        builder
            .target(Target::Pipe(Box::new(DailyLogFile::new(dir)?)))
            .write_style(WriteStyle::Never);
    }

    builder.try_init().context("logger already initialised")
}
