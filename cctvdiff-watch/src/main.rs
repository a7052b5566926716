use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod actions;
mod bridge;
mod capture;
mod compare;
mod logging;
mod output;
mod settings;
mod source_config;
mod timer;
mod worker;

use bridge::PersistenceBridge;
use settings::KeyValueStore;
use source_config::SourceConfig;

/// Still-image motion detector for CCTV cameras.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Statistics file.
    #[arg(long, global = true)]
    stats: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll every configured source until interrupted (the default).
    Run,
    /// Compare two images once and print the result.
    Compare {
        image1: PathBuf,
        image2: PathBuf,
        /// Where to write the detection visualisation.
        output: Option<PathBuf>,
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
        /// Source whose configuration applies.
        #[arg(long, default_value_t = 1)]
        index: usize,
    },
}

fn default_path(file: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cctvdiff").join(file))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| default_path("cctvdiff.conf"))
        .ok_or_else(|| anyhow!("no configuration path given and no config directory found"))?;
    let stats_path = cli
        .stats
        .or_else(|| default_path("cctvdiff-stats.conf"))
        .ok_or_else(|| anyhow!("no statistics path given and no config directory found"))?;

    let config = KeyValueStore::open(&config_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, &stats_path),
        Command::Compare {
            image1,
            image2,
            output,
            json,
            index,
        } => {
            logging::init(None)?;

            let stats = KeyValueStore::open(&stats_path)?;
            let bridge = PersistenceBridge::new(config, stats);
            let source = bridge.source_config(index);
            let state = bridge.load_state(index);

            compare_images(&source, state, &image1, &image2, output.as_deref(), json)
        }
    }
}

fn compare_images(
    config: &SourceConfig,
    state: cctvdiff::prelude::v1::BaselineState,
    image1: &Path,
    image2: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<()> {
    let report = compare::compare(config, state, image1, image2, output)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    Ok(())
}

/// SIGINT and SIGTERM shut down, SIGHUP forces a configuration reload.
#[cfg(unix)]
fn install_signal_handlers(bridge: Arc<PersistenceBridge>) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals =
        Signals::new([SIGINT, SIGTERM, SIGHUP]).context("failed to install signal handler")?;

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                if signal == SIGHUP {
                    info!("[all] Got SIGHUP, reloading configuration");
                    if let Err(e) = bridge.reload() {
                        error!("[all] {:#}", e);
                    }
                } else {
                    info!("[all] Got termination signal, shutting down");
                    bridge.shutdown();
                }
            }
        })
        .context("failed to start signal thread")?;

    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(bridge: Arc<PersistenceBridge>) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("[all] Got termination signal, shutting down");
        bridge.shutdown();
    })
    .context("failed to install signal handler")
}

fn run(config: KeyValueStore, stats_path: &Path) -> Result<()> {
    let config_file = config
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let stats = KeyValueStore::open(stats_path)?;
    let bridge = Arc::new(PersistenceBridge::new(config, stats));

    let global = bridge.global_config();
    logging::init(global.log_location.as_deref())?;

    info!(
        "[all] Starting {} source(s), configuration {}",
        global.sources, config_file
    );

    install_signal_handlers(bridge.clone())?;

    let mut workers = vec![];

    for index in 1..=global.sources {
        match worker::spawn(index, bridge.clone()) {
            Ok(handle) => workers.push(handle),
            Err(e) => error!("[{}] Failed to start worker: {}", index, e),
        }
    }

    let mut last_flush = Instant::now();

    while !bridge.is_shutdown() && bridge.live_workers() > 0 {
        std::thread::sleep(Duration::from_millis(100));

        if last_flush.elapsed() >= global.stats_interval {
            last_flush = Instant::now();
            if let Err(e) = bridge.flush_stats() {
                error!("[all] {:#}", e);
            }
        }
    }

    bridge.shutdown();

    for worker in workers {
        debug!("[all] Waiting for worker {}", worker.index());
        worker.join();
    }

    bridge.flush_stats()?;

    info!("[all] Stopped");

    Ok(())
}
