//! Task reconciliation after (re)registration.
//!
//! ```text
//! start(known) ──▶ explicit reconcile(known) ──▶ statuses redelivered
//!                                      └── or timeout ──▶ implicit reconcile([]) ──▶ reconciled
//! ```
//!
//! Until reconciled, the scheduler declines every offer so that no launch or
//! kill is decided on stale task state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use stagehand_core::TaskStatus;
use tracing::{debug, info, warn};

use crate::driver::SchedulerDriver;

#[derive(Debug)]
pub struct Reconciler {
    timeout: Duration,
    /// Known statuses not yet redelivered, by task id.
    unreconciled: BTreeMap<String, TaskStatus>,
    started_at: Option<Instant>,
    explicit_sent: bool,
    complete: bool,
}

impl Reconciler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            unreconciled: BTreeMap::new(),
            started_at: None,
            explicit_sent: false,
            complete: false,
        }
    }

    /// Begin a reconciliation round for the given last-known statuses.
    pub fn start(&mut self, known: Vec<TaskStatus>, now: Instant) {
        info!(tasks = known.len(), "starting task reconciliation");
        self.unreconciled = known
            .into_iter()
            .map(|s| (s.task_id.clone(), s))
            .collect();
        self.started_at = Some(now);
        self.explicit_sent = false;
        self.complete = false;
    }

    /// Drive reconciliation forward. Called at the start of every offer cycle.
    pub fn reconcile(&mut self, driver: &dyn SchedulerDriver, now: Instant) {
        let Some(started_at) = self.started_at else {
            return;
        };
        if self.complete {
            return;
        }

        if !self.explicit_sent {
            self.explicit_sent = true;
            if !self.unreconciled.is_empty() {
                let statuses: Vec<TaskStatus> = self.unreconciled.values().cloned().collect();
                info!(tasks = statuses.len(), "requesting explicit reconciliation");
                if let Err(e) = driver.reconcile_tasks(&statuses) {
                    warn!(error = %e, "explicit reconciliation request failed");
                }
                return;
            }
        }

        let timed_out = now.saturating_duration_since(started_at) >= self.timeout;
        if self.unreconciled.is_empty() || timed_out {
            if timed_out && !self.unreconciled.is_empty() {
                warn!(
                    remaining = self.unreconciled.len(),
                    "reconciliation timed out, continuing with implicit reconciliation"
                );
            }
            if let Err(e) = driver.reconcile_tasks(&[]) {
                warn!(error = %e, "implicit reconciliation request failed");
            }
            self.unreconciled.clear();
            self.complete = true;
            info!("task reconciliation complete");
        } else {
            debug!(remaining = self.unreconciled.len(), "waiting for reconciliation");
        }
    }

    /// Record a status delivered by the resource manager.
    pub fn update(&mut self, status: &TaskStatus) {
        if self.unreconciled.remove(&status.task_id).is_some() {
            debug!(task_id = %status.task_id, remaining = self.unreconciled.len(), "task reconciled");
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.complete
    }

    pub fn remaining(&self) -> usize {
        self.unreconciled.len()
    }
}
