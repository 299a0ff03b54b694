//! Phases — ordered groups of steps sharing a strategy.

use serde::Serialize;
use stagehand_core::Strategy;

use crate::status::{Status, aggregate};
use crate::step::Step;

#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    name: String,
    strategy: Strategy,
    steps: Vec<Step>,
}

impl Phase {
    pub fn new(name: &str, strategy: Strategy) -> Self {
        Self {
            name: name.to_string(),
            strategy,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    pub fn status(&self) -> Status {
        aggregate(self.steps.iter().map(Step::status))
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_complete()
    }

    /// Indices of steps that may be worked on now.
    ///
    /// Serial phases expose at most the first unfinished step, and only when
    /// it is eligible. Parallel phases expose every eligible step.
    pub fn candidates(&self) -> Vec<usize> {
        match self.strategy {
            Strategy::Serial => self
                .steps
                .iter()
                .position(|s| !s.status().is_complete())
                .filter(|i| self.steps[*i].is_eligible())
                .into_iter()
                .collect(),
            Strategy::Parallel => self
                .steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_eligible())
                .map(|(i, _)| i)
                .collect(),
        }
    }
}
