//! Kills that must be seen through to a terminal status.

use std::collections::BTreeSet;

use stagehand_core::TaskStatus;
use tracing::{debug, info, warn};

use crate::driver::SchedulerDriver;

/// Tracks tasks the scheduler has asked to kill.
///
/// A kill stays pending until a terminal status for that task id arrives.
/// When background kills are enabled, [`TaskKiller::tick`] re-issues every
/// pending kill.
#[derive(Debug, Default)]
pub struct TaskKiller {
    background: bool,
    pending: BTreeSet<String>,
}

impl TaskKiller {
    pub fn new(background: bool) -> Self {
        Self {
            background,
            pending: BTreeSet::new(),
        }
    }

    pub fn kill(&mut self, driver: &dyn SchedulerDriver, task_id: &str) {
        info!(%task_id, "killing task");
        self.pending.insert(task_id.to_string());
        if let Err(e) = driver.kill_task(task_id) {
            warn!(%task_id, error = %e, "kill request failed");
        }
    }

    pub fn on_status(&mut self, status: &TaskStatus) {
        if status.state.is_terminal() && self.pending.remove(&status.task_id) {
            debug!(task_id = %status.task_id, state = %status.state, "kill confirmed");
        }
    }

    /// Re-issue pending kills.
    pub fn tick(&mut self, driver: &dyn SchedulerDriver) {
        if !self.background {
            return;
        }
        for task_id in &self.pending {
            debug!(%task_id, "re-issuing kill");
            if let Err(e) = driver.kill_task(task_id) {
                warn!(%task_id, error = %e, "kill retry failed");
            }
        }
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.pending.contains(task_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }
}
