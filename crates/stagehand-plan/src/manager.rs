//! Plan managers and the customization hook.

use std::collections::HashSet;

use serde::Serialize;
use stagehand_core::{PodInstance, TaskStatus};

use crate::plan::Plan;
use crate::status::Status;

/// Which plan a manager owns. Managers differ only in how their plan is
/// generated and in their priority when competing for offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Recovery,
    Deploy,
    Decommission,
}

#[derive(Debug, Clone)]
pub struct PlanManager {
    kind: PlanKind,
    plan: Plan,
}

impl PlanManager {
    pub fn new(kind: PlanKind, plan: Plan) -> Self {
        Self { kind, plan }
    }

    pub fn kind(&self) -> PlanKind {
        self.kind
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    pub fn set_plan(&mut self, plan: Plan) {
        self.plan = plan;
    }

    /// Pod instances this plan is actively working on.
    pub fn dirty_assets(&self) -> HashSet<PodInstance> {
        self.plan
            .steps()
            .filter(|s| s.status().is_in_progress() || s.status() == Status::Waiting)
            .map(|s| s.instance().clone())
            .collect()
    }

    pub fn update_status(&mut self, task_name: &str, status: &TaskStatus) {
        self.plan.update_status(task_name, status);
    }
}

/// Hook for rewriting generated plans before they are installed.
pub trait PlanCustomizer: Send + Sync {
    fn update_deploy_plan(&self, plan: Plan) -> Plan {
        plan
    }

    fn update_recovery_plan(&self, plan: Plan) -> Plan {
        plan
    }

    fn update_decommission_plan(&self, plan: Plan) -> Plan {
        plan
    }
}
