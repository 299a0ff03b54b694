//! PlanCoordinator — arbitrates candidate steps across plan managers.
//!
//! Managers are consulted in priority order. A pod instance being worked on
//! by one step (its asset is "dirty") is not offered to any other step, so
//! at most one step acts on an instance per cycle.

use std::collections::{HashMap, HashSet};

use stagehand_core::{PodInstance, TaskStatus};

use crate::manager::{PlanKind, PlanManager};
use crate::status::Status;
use crate::step::Step;

/// Address of a step inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub manager: usize,
    pub phase: usize,
    pub step: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PlanCoordinator {
    managers: Vec<PlanManager>,
}

impl PlanCoordinator {
    /// Managers in priority order, highest first.
    pub fn new(managers: Vec<PlanManager>) -> Self {
        Self { managers }
    }

    pub fn managers(&self) -> &[PlanManager] {
        &self.managers
    }

    pub fn manager(&self, kind: PlanKind) -> Option<&PlanManager> {
        self.managers.iter().find(|m| m.kind() == kind)
    }

    pub fn manager_mut(&mut self, kind: PlanKind) -> Option<&mut PlanManager> {
        self.managers.iter_mut().find(|m| m.kind() == kind)
    }

    pub fn step(&self, key: StepKey) -> Option<&Step> {
        self.managers
            .get(key.manager)
            .and_then(|m| m.plan().step(key.phase, key.step))
    }

    pub fn step_mut(&mut self, key: StepKey) -> Option<&mut Step> {
        self.managers
            .get_mut(key.manager)
            .and_then(|m| m.plan_mut().step_mut(key.phase, key.step))
    }

    /// Instances held by in-progress steps of every manager except `kind`.
    pub fn dirty_assets_excluding(&self, kind: PlanKind) -> HashSet<PodInstance> {
        self.managers
            .iter()
            .filter(|m| m.kind() != kind)
            .flat_map(|m| m.dirty_assets())
            .collect()
    }

    /// Candidate steps in priority order, at most one per pod instance.
    pub fn candidates(&self) -> Vec<StepKey> {
        let mut holders: HashMap<PodInstance, StepKey> = HashMap::new();
        for (mi, manager) in self.managers.iter().enumerate() {
            for (pi, phase) in manager.plan().phases().iter().enumerate() {
                for (si, step) in phase.steps().iter().enumerate() {
                    let status = step.status();
                    if status.is_in_progress() || status == Status::Waiting {
                        let key = StepKey { manager: mi, phase: pi, step: si };
                        holders.entry(step.instance().clone()).or_insert(key);
                    }
                }
            }
        }

        let mut out = Vec::new();
        for (mi, manager) in self.managers.iter().enumerate() {
            for (pi, si) in manager.plan().candidates() {
                let key = StepKey { manager: mi, phase: pi, step: si };
                let Some(step) = manager.plan().step(pi, si) else {
                    continue;
                };
                match holders.get(step.instance()) {
                    Some(holder) if *holder != key => continue,
                    Some(_) => {}
                    None => {
                        holders.insert(step.instance().clone(), key);
                    }
                }
                out.push(key);
            }
        }
        out
    }

    /// Route a task status to every manager.
    pub fn update_status(&mut self, task_name: &str, status: &TaskStatus) {
        for manager in &mut self.managers {
            manager.update_status(task_name, status);
        }
    }
}
