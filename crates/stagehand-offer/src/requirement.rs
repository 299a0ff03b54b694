//! What one pod instance needs from an offer.

use stagehand_core::{ConfigId, PodInstance, PodSpec, RecoveryType, Resource, TaskInfo};

/// Resource requirement of a single pod instance under a target config.
#[derive(Debug, Clone)]
pub struct PodInstanceRequirement {
    pub pod: PodSpec,
    pub index: u32,
    pub target_config: ConfigId,
    pub recovery: RecoveryType,
    /// Stored tasks previously launched for this instance.
    pub existing: Vec<TaskInfo>,
}

impl PodInstanceRequirement {
    pub fn new(pod: PodSpec, index: u32, target_config: ConfigId) -> Self {
        Self {
            pod,
            index,
            target_config,
            recovery: RecoveryType::None,
            existing: Vec::new(),
        }
    }

    pub fn with_existing(mut self, tasks: Vec<TaskInfo>) -> Self {
        self.existing = tasks;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryType) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn instance(&self) -> PodInstance {
        self.pod.instance(self.index)
    }

    /// Full task names of every task this requirement launches.
    pub fn task_names(&self) -> Vec<String> {
        let instance = self.instance();
        self.pod
            .tasks
            .iter()
            .map(|t| instance.task_name(&t.name))
            .collect()
    }

    fn reuses_reservations(&self) -> bool {
        self.recovery != RecoveryType::Permanent
    }

    /// The stored task whose reservations a launch of `task` reuses.
    pub fn existing_task(&self, task: &str) -> Option<&TaskInfo> {
        if !self.reuses_reservations() {
            return None;
        }
        let name = self.instance().task_name(task);
        self.existing.iter().find(|t| t.name == name)
    }

    /// Reserved executor resources shared by the instance's previous tasks.
    pub fn existing_executor_resources(&self) -> &[Resource] {
        if !self.reuses_reservations() {
            return &[];
        }
        self.existing
            .iter()
            .map(|t| t.executor.resources.as_slice())
            .find(|r| !r.is_empty())
            .unwrap_or_default()
    }
}
