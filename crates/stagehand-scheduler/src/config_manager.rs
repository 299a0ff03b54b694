//! ConfigManager — validates and publishes target service specs.
//!
//! # Update flow
//!
//! ```text
//! candidate ──▶ validators(old target, candidate)
//!                 ├── errors, no target yet   ──▶ SchedulerError::InvalidConfig
//!                 ├── errors, target exists   ──▶ keep old target, report errors
//!                 └── ok ──▶ store (or reuse id) ──▶ advance target
//!                             ──▶ relabel unchanged tasks ──▶ drop unused configs
//! ```

use std::collections::{BTreeMap, HashSet};

use stagehand_core::{ConfigId, PodSpec, ServiceSpec, TaskInfo};
use stagehand_state::{ConfigStore, StateError, StateStore};
use tracing::{debug, info, warn};

use crate::config::Capabilities;
use crate::error::{SchedulerError, SchedulerResult};
use crate::validation::{ConfigValidationError, ConfigValidator, default_validators};

/// Outcome of a config update.
#[derive(Debug, Clone)]
pub struct ConfigUpdate {
    pub target_id: ConfigId,
    pub target: ServiceSpec,
    /// Non-empty when the candidate was rejected and the old target kept.
    pub errors: Vec<ConfigValidationError>,
}

pub struct ConfigManager {
    configs: ConfigStore<ServiceSpec>,
    state: StateStore,
    validators: Vec<Box<dyn ConfigValidator>>,
}

impl ConfigManager {
    pub fn new(configs: ConfigStore<ServiceSpec>, state: StateStore, capabilities: Capabilities) -> Self {
        Self {
            configs,
            state,
            validators: default_validators(capabilities),
        }
    }

    pub fn configs(&self) -> &ConfigStore<ServiceSpec> {
        &self.configs
    }

    /// The current target, if one has been published.
    pub fn target(&self) -> SchedulerResult<Option<(ConfigId, ServiceSpec)>> {
        match self.configs.fetch_target_id()? {
            Some(id) => Ok(Some((id, self.configs.fetch(id)?))),
            None => Ok(None),
        }
    }

    fn check(&self, old: Option<&ServiceSpec>, candidate: &ServiceSpec) -> Vec<ConfigValidationError> {
        self.validators
            .iter()
            .flat_map(|v| v.validate(old, candidate))
            .collect()
    }

    /// Errors `candidate` would raise against the current target. Nothing is stored.
    pub fn validate(&self, candidate: &ServiceSpec) -> SchedulerResult<Vec<ConfigValidationError>> {
        let current = self.target()?;
        Ok(self.check(current.as_ref().map(|(_, spec)| spec), candidate))
    }

    /// Validate `candidate` and, if acceptable, make it the target.
    pub fn update(&self, candidate: &ServiceSpec) -> SchedulerResult<ConfigUpdate> {
        let current = self.target()?;
        let errors = self.check(current.as_ref().map(|(_, spec)| spec), candidate);

        if !errors.is_empty() {
            for error in &errors {
                warn!(service = %candidate.name, %error, "config validation failed");
            }
            return match current {
                Some((target_id, target)) => Ok(ConfigUpdate {
                    target_id,
                    target,
                    errors,
                }),
                None => Err(SchedulerError::InvalidConfig(errors)),
            };
        }

        let target_id = match &current {
            Some((id, spec)) if spec == candidate => {
                debug!(%id, "candidate equals current target, keeping id");
                *id
            }
            _ => {
                let id = self.configs.store(candidate)?;
                self.configs.set_target_id(id)?;
                info!(%id, service = %candidate.name, "new target config published");
                id
            }
        };

        self.relabel_tasks(target_id, candidate)?;
        self.collect_garbage(target_id)?;

        Ok(ConfigUpdate {
            target_id,
            target: candidate.clone(),
            errors: Vec::new(),
        })
    }

    /// Point tasks whose definition did not change at the new target.
    fn relabel_tasks(&self, target_id: ConfigId, target: &ServiceSpec) -> SchedulerResult<()> {
        let mut specs: BTreeMap<ConfigId, Option<ServiceSpec>> = BTreeMap::new();
        let mut relabelled = Vec::new();
        for task in self.state.fetch_tasks()? {
            if task.target_config == target_id {
                continue;
            }
            if !specs.contains_key(&task.target_config) {
                let fetched = match self.configs.fetch(task.target_config) {
                    Ok(spec) => Some(spec),
                    Err(StateError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };
                specs.insert(task.target_config, fetched);
            }
            let Some(Some(launched_under)) = specs.get(&task.target_config) else {
                debug!(task = %task.name, config = %task.target_config, "launch config missing, not relabelling");
                continue;
            };
            if task_unchanged(&task, launched_under, target) {
                relabelled.push(TaskInfo {
                    target_config: target_id,
                    ..task
                });
            }
        }

        if !relabelled.is_empty() {
            for task in &relabelled {
                info!(task = %task.name, config = %target_id, "task definition unchanged, relabelled");
            }
            self.state.store_tasks(&relabelled)?;
        }
        Ok(())
    }

    /// Delete stored configs referenced by neither the target nor a task.
    fn collect_garbage(&self, target_id: ConfigId) -> SchedulerResult<()> {
        let mut referenced: HashSet<ConfigId> = HashSet::from([target_id]);
        referenced.extend(self.state.fetch_tasks()?.iter().map(|t| t.target_config));
        for id in self.configs.list()? {
            if !referenced.contains(&id) {
                self.configs.clear(id)?;
            }
        }
        Ok(())
    }
}

fn effective_user<'a>(spec: &'a ServiceSpec, pod: &'a PodSpec) -> Option<&'a str> {
    pod.user.as_deref().or(spec.user.as_deref())
}

/// Whether `task` would be launched identically under `new` as under `old`.
fn task_unchanged(task: &TaskInfo, old: &ServiceSpec, new: &ServiceSpec) -> bool {
    let (Some(old_pod), Some(new_pod)) = (old.pod(&task.pod_type), new.pod(&task.pod_type)) else {
        return false;
    };
    let prefix = format!("{}-", task.pod_instance());
    let Some(short_name) = task.name.strip_prefix(prefix.as_str()) else {
        return false;
    };
    match (old_pod.task(short_name), new_pod.task(short_name)) {
        (Some(old_task), Some(new_task)) => {
            old_task == new_task
                && old_pod.executor == new_pod.executor
                && old_pod.resource_set_id() == new_pod.resource_set_id()
                && effective_user(old, old_pod) == effective_user(new, new_pod)
        }
        _ => false,
    }
}
