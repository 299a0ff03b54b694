//! Plans — ordered phases plus plan-level errors.

use serde::Serialize;
use stagehand_core::{Strategy, TaskStatus};

use crate::phase::Phase;
use crate::status::{Status, aggregate};
use crate::step::Step;

pub const DEPLOY_PLAN: &str = "deploy";
pub const RECOVERY_PLAN: &str = "recovery";
pub const DECOMMISSION_PLAN: &str = "decommission";

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    name: String,
    strategy: Strategy,
    phases: Vec<Phase>,
    errors: Vec<String>,
}

impl Plan {
    pub fn new(name: &str, strategy: Strategy) -> Self {
        Self {
            name: name.to_string(),
            strategy,
            phases: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phases_mut(&mut self) -> &mut Vec<Phase> {
        &mut self.phases
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name() == name)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// ERROR while configuration errors are attached, otherwise the phase aggregate.
    pub fn status(&self) -> Status {
        if !self.errors.is_empty() {
            return Status::Error;
        }
        aggregate(self.phases.iter().map(Phase::status))
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_complete()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps().iter())
    }

    pub fn step(&self, phase: usize, step: usize) -> Option<&Step> {
        self.phases.get(phase).and_then(|p| p.steps().get(step))
    }

    pub fn step_mut(&mut self, phase: usize, step: usize) -> Option<&mut Step> {
        self.phases
            .get_mut(phase)
            .and_then(|p| p.steps_mut().get_mut(step))
    }

    /// `(phase, step)` indices of steps that may be worked on now.
    ///
    /// Serial plans only look at the first unfinished phase.
    pub fn candidates(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (pi, phase) in self.phases.iter().enumerate() {
            if phase.is_complete() {
                continue;
            }
            out.extend(phase.candidates().into_iter().map(|si| (pi, si)));
            if self.strategy == Strategy::Serial {
                break;
            }
        }
        out
    }

    /// Route a task status to every step.
    pub fn update_status(&mut self, task_name: &str, status: &TaskStatus) {
        for phase in &mut self.phases {
            for step in phase.steps_mut() {
                step.update_status(task_name, status);
            }
        }
    }
}
