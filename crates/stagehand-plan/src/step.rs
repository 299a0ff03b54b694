//! Steps — the unit of work a plan drives to completion.
//!
//! Every step acts on one pod instance. What it does is determined by its
//! [`StepKind`]; how its status moves is the transition table below.
//!
//! ```text
//! Launch:        PENDING ─no offer / kill issued─▶ PREPARED
//!                PENDING|PREPARED ─accepted─▶ STARTING ─running─▶ STARTED ─ready─▶ COMPLETE
//!                STARTING|STARTED ─task failed─▶ PENDING
//! Decommission:  PENDING ─kill issued─▶ WAITING ─all terminal─▶ COMPLETE
//! Cleanup:       PENDING ─records erased─▶ COMPLETE
//! any ─restart─▶ PENDING        any ─error─▶ ERROR (sticky)
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stagehand_core::{GoalState, PodInstance, RecoveryType, TaskState, TaskStatus};
use tracing::{debug, info};
use uuid::Uuid;

use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Launch (or relaunch) the instance's tasks from an offer.
    Launch { recovery: RecoveryType },
    /// Kill the instance's tasks and wait for them to terminate.
    Decommission,
    /// Erase the instance's task records, orphaning their reservations.
    Cleanup,
    /// Nothing to do.
    NoOp,
}

/// A task a step is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTarget {
    /// Full task name, e.g. `POD-A-0-A`.
    pub name: String,
    pub goal: GoalState,
    pub readiness_check: bool,
}

impl TaskTarget {
    pub fn new(name: &str, goal: GoalState, readiness_check: bool) -> Self {
        Self {
            name: name.to_string(),
            goal,
            readiness_check,
        }
    }

    /// Whether a status means this task reached its goal.
    fn reached_goal(&self, state: TaskState, ready: bool) -> bool {
        match self.goal {
            GoalState::Running => state == TaskState::Running && (ready || !self.readiness_check),
            GoalState::Finish => state == TaskState::Finished,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TaskProgress {
    task_id: String,
    state: Option<TaskState>,
    ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    id: Uuid,
    name: String,
    instance: PodInstance,
    kind: StepKind,
    status: Status,
    tasks: Vec<TaskTarget>,
    errors: Vec<String>,
    #[serde(skip)]
    progress: BTreeMap<String, TaskProgress>,
}

impl Step {
    fn new(name: String, instance: PodInstance, kind: StepKind, tasks: Vec<TaskTarget>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            instance,
            kind,
            status: Status::Pending,
            tasks,
            errors: Vec::new(),
            progress: BTreeMap::new(),
        }
    }

    /// Display name such as `POD-A-0:[A]`.
    fn launch_name(instance: &PodInstance, tasks: &[TaskTarget]) -> String {
        let prefix = format!("{instance}-");
        let short: Vec<&str> = tasks
            .iter()
            .map(|t| t.name.strip_prefix(prefix.as_str()).unwrap_or(&t.name))
            .collect();
        format!("{instance}:[{}]", short.join(", "))
    }

    pub fn launch(instance: PodInstance, tasks: Vec<TaskTarget>, recovery: RecoveryType) -> Self {
        let name = Self::launch_name(&instance, &tasks);
        Self::new(name, instance, StepKind::Launch { recovery }, tasks)
    }

    pub fn decommission(instance: PodInstance, tasks: Vec<TaskTarget>) -> Self {
        let name = format!("kill-{instance}");
        Self::new(name, instance, StepKind::Decommission, tasks)
    }

    pub fn cleanup(instance: PodInstance, tasks: Vec<TaskTarget>) -> Self {
        let name = format!("unreserve-{instance}");
        Self::new(name, instance, StepKind::Cleanup, tasks)
    }

    pub fn noop(name: &str, instance: PodInstance) -> Self {
        let mut step = Self::new(name.to_string(), instance, StepKind::NoOp, Vec::new());
        step.status = Status::Complete;
        step
    }

    /// Set the initial status of a freshly built step.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &PodInstance {
        &self.instance
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn tasks(&self) -> &[TaskTarget] {
        &self.tasks
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_eligible(&self) -> bool {
        self.status.is_eligible()
    }

    fn transition(&mut self, to: Status) {
        if self.status == to {
            return;
        }
        info!(step = %self.name, from = %self.status, %to, "step transition");
        self.status = to;
    }

    fn track(&mut self, task_ids: &BTreeMap<String, String>) {
        self.progress = task_ids
            .iter()
            .filter(|(name, _)| self.tasks.iter().any(|t| &t.name == *name))
            .map(|(name, id)| {
                let progress = TaskProgress {
                    task_id: id.clone(),
                    ..TaskProgress::default()
                };
                (name.clone(), progress)
            })
            .collect();
    }

    // ── Offer-cycle events ─────────────────────────────────────────

    /// No offer satisfied the step this cycle.
    pub fn offer_missed(&mut self) {
        if self.status == Status::Pending {
            self.transition(Status::Prepared);
        }
    }

    /// Operations launching `task_ids` (task name → task id) were accepted.
    pub fn launched(&mut self, task_ids: &BTreeMap<String, String>) {
        if self.status == Status::Error || !matches!(self.kind, StepKind::Launch { .. }) {
            return;
        }
        self.track(task_ids);
        self.transition(Status::Starting);
    }

    /// Kills were issued for `task_ids` (task name → task id).
    pub fn kill_issued(&mut self, task_ids: &BTreeMap<String, String>) {
        match self.kind {
            StepKind::Launch { .. } => self.offer_missed(),
            StepKind::Decommission if self.is_eligible() => {
                self.track(task_ids);
                if self.progress.is_empty() {
                    self.transition(Status::Complete);
                } else {
                    self.transition(Status::Waiting);
                }
            }
            _ => {}
        }
    }

    /// Drive the step to COMPLETE without further work.
    pub fn force_complete(&mut self) {
        if self.status != Status::Error {
            self.progress.clear();
            self.transition(Status::Complete);
        }
    }

    /// Return the step to PENDING, e.g. after its target changed.
    pub fn restart(&mut self) {
        self.progress.clear();
        self.errors.clear();
        self.transition(Status::Pending);
    }

    pub fn set_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
        self.transition(Status::Error);
    }

    // ── Status updates ─────────────────────────────────────────────

    /// React to a status update for `task_name`.
    pub fn update_status(&mut self, task_name: &str, status: &TaskStatus) {
        if self.status == Status::Error {
            return;
        }
        let Some(progress) = self.progress.get_mut(task_name) else {
            return;
        };
        if progress.task_id != status.task_id {
            debug!(step = %self.name, task_id = %status.task_id, "ignoring status for untracked task id");
            return;
        }

        match self.kind {
            StepKind::Launch { .. } => {
                if !matches!(self.status, Status::Starting | Status::Started) {
                    return;
                }
                let Some(target) = self.tasks.iter().find(|t| t.name == task_name) else {
                    return;
                };
                if status.state.is_failure_for(target.goal) {
                    info!(step = %self.name, task = %task_name, state = %status.state, "launched task failed");
                    self.progress.clear();
                    self.transition(Status::Pending);
                    return;
                }
                progress.state = Some(status.state);
                progress.ready |= status.readiness_passed();
                self.reconcile_launch_progress();
            }
            StepKind::Decommission => {
                if self.status != Status::Waiting || !status.state.is_terminal() {
                    return;
                }
                progress.state = Some(status.state);
                if self
                    .progress
                    .values()
                    .all(|p| p.state.is_some_and(|s| s.is_terminal()))
                {
                    self.transition(Status::Complete);
                }
            }
            StepKind::Cleanup | StepKind::NoOp => {}
        }
    }

    fn reconcile_launch_progress(&mut self) {
        let all_done = self.tasks.iter().all(|target| {
            self.progress
                .get(&target.name)
                .and_then(|p| p.state.map(|s| target.reached_goal(s, p.ready)))
                .unwrap_or(false)
        });
        if all_done {
            self.transition(Status::Complete);
        } else if self
            .progress
            .values()
            .any(|p| p.state == Some(TaskState::Running))
        {
            self.transition(Status::Started);
        }
    }
}
