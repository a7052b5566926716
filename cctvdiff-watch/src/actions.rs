//! # Detection transition commands

use crate::capture::run_with_timeout;
use crate::source_config::ActionTemplates;
use cctvdiff::prelude::v1::Transition;
use log::*;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

/// Runs the configured shell command of each transition without waiting for it.
pub struct ActionRunner {
    index: usize,
    templates: ActionTemplates,
    timeout: Duration,
}

impl ActionRunner {
    /// # Arguments
    ///
    /// * `index` - source index, used to tag log records.
    /// * `templates` - command templates per transition.
    /// * `timeout` - commands still running after this long are killed.
    pub fn new(index: usize, templates: ActionTemplates, timeout: Duration) -> Self {
        Self {
            index,
            templates,
            timeout,
        }
    }

    pub fn set_templates(&mut self, templates: ActionTemplates, timeout: Duration) {
        self.templates = templates;
        self.timeout = timeout;
    }

    /// Command line for a transition, or `None` if nothing is configured for it.
    pub fn command_for(&self, transition: &Transition) -> Option<String> {
        let template = match transition {
            Transition::DetectionStart { .. } => &self.templates.detection_start,
            Transition::Detection { .. } => &self.templates.detection,
            Transition::DetectionEnd { .. } => &self.templates.detection_end,
            Transition::NoDetection { .. } => &self.templates.no_detection,
        };

        template.as_ref().map(|t| {
            t.replace("{level}", &format!("{:.4}", transition.level()))
                .replace("{detcount}", &transition.detcount().to_string())
        })
    }

    /// Fire off the commands of all `transitions`, in order.
    ///
    /// Each command runs on its own thread. The handles are returned for callers that want to
    /// wait, dropping them detaches the commands.
    pub fn run(&self, transitions: &[Transition]) -> Vec<JoinHandle<()>> {
        transitions
            .iter()
            .filter_map(|t| self.command_for(t))
            .filter_map(|cmd| spawn_command(self.index, cmd, self.timeout))
            .collect()
    }
}

/// Run `cmd` through `sh -c` on a background thread, reporting failures to the log.
///
/// The thread ends once the command exits or is killed after `timeout`.
pub fn spawn_command(index: usize, cmd: String, timeout: Duration) -> Option<JoinHandle<()>> {
    debug!("[{}] Running '{}'", index, cmd);

    let res = Builder::new()
        .name(format!("action-{}", index))
        .spawn(move || match run_with_timeout(&cmd, timeout) {
            Ok(status) if status.success() => {}
            Ok(status) => error!("[{}] Command '{}' failed with {}", index, cmd, status),
            Err(e) => error!("[{}] {}", index, e),
        });

    match res {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("[{}] Failed to spawn action thread: {}", index, e);
            None
        }
    }
}
