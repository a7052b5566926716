//! # Shared configuration and statistics
//!
//! Source workers share nothing but this bridge. Both stores sit behind one lock that is only
//! held for the duration of a single lookup or update, never across capture or pixel work.

use crate::settings::{scoped_key, KeyValueStore};
use crate::source_config::{GlobalConfig, SourceConfig};
use anyhow::Result;
use cctvdiff::prelude::v1::{Baseline, BaselineState};
use log::*;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Statistics published after every processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatsRecord {
    pub state: BaselineState,
    pub level: f64,
    pub raw_level: f64,
}

struct Stores {
    config: KeyValueStore,
    stats: KeyValueStore,
}

pub struct PersistenceBridge {
    stores: Mutex<Stores>,
    generation: AtomicU64,
    live_workers: AtomicUsize,
    shutdown: AtomicBool,
}

impl PersistenceBridge {
    pub fn new(config: KeyValueStore, stats: KeyValueStore) -> Self {
        Self {
            stores: Mutex::new(Stores { config, stats }),
            generation: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<Stores> {
        // A worker that panicked mid-update leaves at worst one stale key behind.
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn global_config(&self) -> GlobalConfig {
        GlobalConfig::resolve(&self.lock().config)
    }

    pub fn source_config(&self, index: usize) -> SourceConfig {
        SourceConfig::resolve(&self.lock().config, index)
    }

    /// Restore the persisted detector state of a source. Missing or unparsable keys are zero.
    pub fn load_state(&self, index: usize) -> BaselineState {
        let stores = self.lock();
        let stats = &stores.stats;

        BaselineState {
            baseline: Baseline {
                fast_avg: stats_value(stats, "fastavg", index),
                fast_sd: stats_value(stats, "fastsd", index),
                slow_avg: stats_value(stats, "slowavg", index),
                slow_sd: stats_value(stats, "slowsd", index),
            },
            seqno: stats_value(stats, "seqno", index),
            last_saved: stats_value(stats, "lastsaved", index),
        }
    }

    pub fn record(&self, index: usize, record: &StatsRecord) {
        let StatsRecord {
            state,
            level,
            raw_level,
        } = record;
        let b = &state.baseline;

        let mut stores = self.lock();
        let stats = &mut stores.stats;

        // Display of f64 is the shortest representation that parses back to the same value.
        stats.set(scoped_key("fastavg", index), b.fast_avg.to_string());
        stats.set(scoped_key("fastsd", index), b.fast_sd.to_string());
        stats.set(scoped_key("slowavg", index), b.slow_avg.to_string());
        stats.set(scoped_key("slowsd", index), b.slow_sd.to_string());
        stats.set(scoped_key("seqno", index), state.seqno.to_string());
        stats.set(scoped_key("lastsaved", index), state.last_saved.to_string());
        stats.set(scoped_key("level", index), level.to_string());
        stats.set(scoped_key("rawlevel", index), raw_level.to_string());
    }

    pub fn record_lag(&self, index: usize, lag: Duration) {
        self.lock()
            .stats
            .set(scoped_key("lag", index), format!("{:.3}", lag.as_secs_f64()));
    }

    /// Check the configuration file for external edits, bumping the generation on change.
    pub fn check_for_changes(&self) -> bool {
        let changed = self.lock().config.has_file_changed();
        if changed {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            info!("[all] Configuration changed (generation {})", generation);
        }
        changed
    }

    /// Re-read the configuration file unconditionally and bump the generation.
    pub fn reload(&self) -> Result<()> {
        self.lock().config.read()?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("[all] Configuration reloaded (generation {})", generation);
        Ok(())
    }

    /// Reconfiguration counter. Workers reload their settings whenever it moves.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Write the statistics store if anything changed since the last flush.
    pub fn flush_stats(&self) -> Result<()> {
        let mut stores = self.lock();
        if stores.stats.is_dirty() {
            stores.stats.write()?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::Acquire)
    }

    /// Count a worker as live until the returned guard is dropped.
    pub fn worker_started(self: &Arc<Self>) -> LiveWorker {
        self.live_workers.fetch_add(1, Ordering::AcqRel);
        LiveWorker {
            bridge: self.clone(),
        }
    }
}

pub struct LiveWorker {
    bridge: Arc<PersistenceBridge>,
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.bridge.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn stats_value<T: FromStr + Default>(stats: &KeyValueStore, key: &str, index: usize) -> T {
    stats
        .get(&scoped_key(key, index))
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
