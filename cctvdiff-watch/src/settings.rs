//! # Key/value settings files
//!
//! Both the configuration and the statistics store use the same plain text format: one
//! `key=value` pair per line, `#` comment lines and blank lines ignored, later duplicates winning.
//! Per-source overrides are ordinary keys of the form `key:index`.

use anyhow::{Context, Result};
use log::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Default)]
pub struct KeyValueStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
    modified: Option<SystemTime>,
    content: String,
    dirty: bool,
}

impl KeyValueStore {
    /// Open a store backed by `path`.
    ///
    /// A missing file is not an error, the store simply starts out empty and is created on the
    /// first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            path: Some(path.into()),
            ..Default::default()
        };
        store.read()?;
        Ok(store)
    }

    /// Create an in-memory store from text. It is never written anywhere.
    pub fn parse(text: &str) -> Self {
        Self {
            values: parse_lines(text),
            content: text.into(),
            ..Default::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file, replacing every value.
    pub fn read(&mut self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        match fs::read_to_string(path) {
            Ok(content) => {
                self.modified = modified_time(path);
                self.values = parse_lines(&content);
                self.content = content;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[all] {} does not exist yet", path.display());
                self.modified = None;
                self.values.clear();
                self.content.clear();
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        }

        self.dirty = false;

        Ok(())
    }

    /// Check whether the backing file was changed externally, and reload it if so.
    ///
    /// Only a differing modification time triggers a read, and only differing content counts as
    /// a change. Unsaved local modifications are discarded on reload.
    pub fn has_file_changed(&mut self) -> bool {
        let path = match &self.path {
            Some(path) => path,
            None => return false,
        };

        let modified = modified_time(path);

        if modified == self.modified {
            return false;
        }

        self.modified = modified;

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                warn!("[all] Failed to re-read {}: {}", path.display(), e);
                return false;
            }
        };

        if content == self.content {
            return false;
        }

        self.values = parse_lines(&content);
        self.content = content;
        self.dirty = false;

        true
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up `key:index`, falling back to the unscoped `key`.
    pub fn get_scoped(&self, key: &str, index: usize) -> Option<&str> {
        self.get(&scoped_key(key, index)).or_else(|| self.get(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let slot = self.values.entry(key.into()).or_default();
        if *slot != value {
            *slot = value;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Serialise every value, sorted by key.
    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }

    /// Write the store back to its file, creating parent directories as needed.
    pub fn write(&mut self) -> Result<()> {
        let content = self.render();

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(path, &content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            self.modified = modified_time(path);
        }

        self.content = content;
        self.dirty = false;

        Ok(())
    }
}

pub fn scoped_key(key: &str, index: usize) -> String {
    format!("{}:{}", key, index)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn parse_lines(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}
