//! Plan generation from the target spec and stored task state.
//!
//! ```text
//! deploy        phase per pod (pod strategy), step per instance
//! recovery      phase per failed instance, one Launch{Transient|Permanent} step
//! decommission  phase per removed instance: kill (or no-op) ──▶ unreserve
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};

use stagehand_core::{
    ConfigId, GoalState, PodInstance, PodSpec, RecoveryType, ServiceSpec, Strategy, TaskInfo,
    TaskState, TaskStatus,
};
use stagehand_plan::{
    DECOMMISSION_PLAN, DEPLOY_PLAN, Phase, Plan, RECOVERY_PLAN, Status, Step, StepKind, TaskTarget,
};
use stagehand_state::StateStore;
use tracing::{debug, info};

use crate::config::RecoveryStrategy;
use crate::error::SchedulerResult;
use crate::validation::ConfigValidationError;

/// Task property marking a task for replacement on fresh reservations.
pub const PERMANENTLY_FAILED_PROPERTY: &str = "permanently-failed";

/// A snapshot of every stored task record.
#[derive(Debug, Clone, Default)]
pub struct StoredTasks {
    infos: BTreeMap<String, TaskInfo>,
    statuses: BTreeMap<String, TaskStatus>,
    permanently_failed: BTreeSet<String>,
}

impl StoredTasks {
    pub fn load(state: &StateStore) -> SchedulerResult<Self> {
        let mut tasks = Self::default();
        for name in state.fetch_task_names()? {
            let Some(info) = state.fetch_task(&name)? else {
                continue;
            };
            if let Some(status) = state.fetch_status(&name)? {
                tasks.statuses.insert(name.clone(), status);
            }
            if state
                .fetch_property(&name, PERMANENTLY_FAILED_PROPERTY)?
                .is_some()
            {
                tasks.permanently_failed.insert(name.clone());
            }
            tasks.infos.insert(name, info);
        }
        Ok(tasks)
    }

    pub fn info(&self, name: &str) -> Option<&TaskInfo> {
        self.infos.get(name)
    }

    pub fn status(&self, name: &str) -> Option<&TaskStatus> {
        self.statuses.get(name)
    }

    pub fn infos(&self) -> impl Iterator<Item = &TaskInfo> {
        self.infos.values()
    }

    /// Whether the task has a record and has not reached a terminal state.
    pub fn is_alive(&self, name: &str) -> bool {
        self.infos.contains_key(name)
            && self
                .statuses
                .get(name)
                .is_none_or(|s| !s.state.is_terminal())
    }

    pub fn is_permanently_failed(&self, name: &str) -> bool {
        self.permanently_failed.contains(name)
    }

    /// Stored tasks grouped by pod instance.
    pub fn by_instance(&self) -> BTreeMap<PodInstance, Vec<&TaskInfo>> {
        let mut grouped: BTreeMap<PodInstance, Vec<&TaskInfo>> = BTreeMap::new();
        for info in self.infos.values() {
            grouped.entry(info.pod_instance()).or_default().push(info);
        }
        grouped
    }
}

pub fn task_targets(pod: &PodSpec, instance: &PodInstance) -> Vec<TaskTarget> {
    pod.tasks
        .iter()
        .map(|t| {
            TaskTarget::new(
                &instance.task_name(&t.name),
                t.goal,
                t.readiness_check.is_some(),
            )
        })
        .collect()
}

/// Whether a task is at its goal under `target_id`.
pub fn task_at_goal(target: &TaskTarget, target_id: ConfigId, tasks: &StoredTasks) -> bool {
    let (Some(info), Some(status)) = (tasks.info(&target.name), tasks.status(&target.name)) else {
        return false;
    };
    if info.target_config != target_id || info.task_id != status.task_id {
        return false;
    }
    match target.goal {
        GoalState::Running => {
            status.state == TaskState::Running && (!target.readiness_check || status.readiness_passed())
        }
        GoalState::Finish => status.state == TaskState::Finished,
    }
}

// ── Deploy ─────────────────────────────────────────────────────────

/// The deployment plan for `target`. Instances already at goal start COMPLETE.
///
/// `errors` come from a rejected candidate: they are attached to the plan, and
/// every step of a pod they name is put in ERROR until a valid config arrives.
pub fn deploy_plan(
    target_id: ConfigId,
    target: &ServiceSpec,
    tasks: &StoredTasks,
    errors: &[ConfigValidationError],
) -> Plan {
    let mut plan = Plan::new(DEPLOY_PLAN, Strategy::Serial)
        .with_errors(errors.iter().map(ToString::to_string).collect());
    for pod in &target.pods {
        let rejected: Vec<String> = errors
            .iter()
            .filter(|e| e.pod_name() == Some(pod.name.as_str()))
            .map(ToString::to_string)
            .collect();
        let mut phase = Phase::new(&pod.name, pod.strategy);
        for index in 0..pod.count {
            let instance = pod.instance(index);
            let targets = task_targets(pod, &instance);
            let at_goal = targets.iter().all(|t| task_at_goal(t, target_id, tasks));
            let mut step = Step::launch(instance, targets, RecoveryType::None);
            if at_goal {
                step = step.with_status(Status::Complete);
            }
            for error in &rejected {
                step.set_error(error);
            }
            phase = phase.with_step(step);
        }
        plan = plan.with_phase(phase);
    }
    plan
}

// ── Recovery ───────────────────────────────────────────────────────

/// Inputs for regenerating the recovery plan.
pub struct RecoveryInputs<'a> {
    pub target: &'a ServiceSpec,
    pub tasks: &'a StoredTasks,
    /// Instances other plans are working on.
    pub dirty: &'a HashSet<PodInstance>,
    pub pending_kills: &'a BTreeSet<String>,
    pub strategy: RecoveryStrategy,
}

fn recovery_needed(
    inputs: &RecoveryInputs<'_>,
    pod: &PodSpec,
    instance: &PodInstance,
    infos: &[&TaskInfo],
) -> Option<RecoveryType> {
    if instance.index >= pod.count || inputs.dirty.contains(instance) {
        return None;
    }
    let mut failed = false;
    let mut permanent = false;
    for info in infos {
        if inputs.pending_kills.contains(&info.task_id) {
            return None;
        }
        let status = inputs.tasks.status(&info.name);
        let is_failed = status
            .is_some_and(|s| s.task_id == info.task_id && s.state.is_failure_for(info.goal));
        failed |= is_failed;
        permanent |= is_failed && inputs.tasks.is_permanently_failed(&info.name);
    }
    match (failed, permanent) {
        (false, _) => None,
        (true, true) => Some(RecoveryType::Permanent),
        (true, false) if inputs.strategy == RecoveryStrategy::Manual => None,
        (true, false) => Some(RecoveryType::Transient),
    }
}

fn recovery_of(step: &Step) -> Option<RecoveryType> {
    match step.kind() {
        StepKind::Launch { recovery } => Some(recovery),
        _ => None,
    }
}

/// Regenerate the recovery plan, keeping the progress of existing phases.
///
/// An existing phase survives while its step is in progress or in error, or
/// while its instance still needs the same kind of recovery.
pub fn recovery_plan(inputs: &RecoveryInputs<'_>, existing: Option<&Plan>) -> Plan {
    let mut needed: BTreeMap<PodInstance, RecoveryType> = BTreeMap::new();
    for (instance, infos) in inputs.tasks.by_instance() {
        let Some(pod) = inputs.target.pod(&instance.pod_type) else {
            continue;
        };
        if let Some(recovery) = recovery_needed(inputs, pod, &instance, &infos) {
            needed.insert(instance, recovery);
        }
    }

    let mut plan = Plan::new(RECOVERY_PLAN, Strategy::Parallel);
    let mut kept = HashSet::new();
    for phase in existing.map(Plan::phases).unwrap_or_default() {
        let Some(step) = phase.steps().first() else {
            continue;
        };
        let status = step.status();
        let keep = status.is_in_progress()
            || status == Status::Error
            || (status.is_eligible() && needed.get(step.instance()).copied() == recovery_of(step));
        if keep && kept.insert(step.instance().clone()) {
            plan = plan.with_phase(phase.clone());
        }
    }

    for (instance, recovery) in needed {
        if kept.contains(&instance) {
            continue;
        }
        let Some(pod) = inputs.target.pod(&instance.pod_type) else {
            continue;
        };
        info!(%instance, ?recovery, "generating recovery step");
        let step = Step::launch(instance.clone(), task_targets(pod, &instance), recovery);
        plan = plan.with_phase(Phase::new(&instance.to_string(), Strategy::Serial).with_step(step));
    }
    debug!(phases = plan.phases().len(), "recovery plan refreshed");
    plan
}

// ── Decommission ───────────────────────────────────────────────────

/// Phases for every stored instance that is no longer in `target`.
///
/// Phases of `existing` that are still in progress are kept as they are.
pub fn decommission_plan(target: &ServiceSpec, tasks: &StoredTasks, existing: Option<&Plan>) -> Plan {
    let mut plan = Plan::new(DECOMMISSION_PLAN, Strategy::Serial);
    for (instance, infos) in tasks.by_instance() {
        let in_range = target
            .pod(&instance.pod_type)
            .is_some_and(|pod| instance.index < pod.count);
        if in_range {
            continue;
        }

        let name = instance.to_string();
        if let Some(phase) = existing
            .and_then(|p| p.phase(&name))
            .filter(|p| !p.is_complete() && p.status() != Status::Pending)
        {
            plan = plan.with_phase(phase.clone());
            continue;
        }

        let targets: Vec<TaskTarget> = infos
            .iter()
            .map(|info| TaskTarget::new(&info.name, info.goal, info.readiness_check.is_some()))
            .collect();
        let any_alive = infos.iter().any(|info| tasks.is_alive(&info.name));
        let kill = if any_alive {
            Step::decommission(instance.clone(), targets.clone())
        } else {
            Step::noop(&format!("kill-{instance}"), instance.clone())
        };
        info!(%instance, alive = any_alive, "scheduling decommission");
        plan = plan.with_phase(
            Phase::new(&name, Strategy::Serial)
                .with_step(kill)
                .with_step(Step::cleanup(instance, targets)),
        );
    }
    plan
}
