//! Service spec validation.
//!
//! Validators run against a candidate spec and, when one exists, the
//! current target. Each returns every problem it finds; an empty result
//! means the candidate is acceptable.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use stagehand_core::{PodSpec, ServiceSpec, TaskSpec};

use crate::config::Capabilities;

/// One reason a candidate spec was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigValidationError {
    pub field: String,
    /// Previous value, present for rejected transitions.
    pub old_value: Option<String>,
    pub new_value: String,
    pub message: String,
}

impl ConfigValidationError {
    pub fn value(field: &str, value: impl ToString, message: &str) -> Self {
        Self {
            field: field.to_string(),
            old_value: None,
            new_value: value.to_string(),
            message: message.to_string(),
        }
    }

    pub fn transition(
        field: &str,
        old_value: impl ToString,
        new_value: impl ToString,
        message: &str,
    ) -> Self {
        Self {
            field: field.to_string(),
            old_value: Some(old_value.to_string()),
            new_value: new_value.to_string(),
            message: message.to_string(),
        }
    }

    /// The pod the error is about, for fields under `PodSpec[<name>]`.
    pub fn pod_name(&self) -> Option<&str> {
        self.field
            .strip_prefix("PodSpec[")
            .and_then(|rest| rest.split_once(']'))
            .map(|(name, _)| name)
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old_value {
            Some(old) => write!(
                f,
                "Field: '{}'; Transition: '{}' => '{}'; Message: '{}'",
                self.field, old, self.new_value, self.message
            ),
            None => write!(
                f,
                "Field: '{}'; Value: '{}'; Message: '{}'",
                self.field, self.new_value, self.message
            ),
        }
    }
}

/// Checks a candidate spec, optionally against the current target.
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError>;
}

/// The validators every update runs through.
pub fn default_validators(capabilities: Capabilities) -> Vec<Box<dyn ConfigValidator>> {
    vec![
        Box::new(SpecIsolationValidator::new(capabilities)),
        Box::new(ServiceNameCannotChange),
        Box::new(UserCannotChange),
        Box::new(PodSpecsCannotShrink),
        Box::new(TaskVolumesCannotChange),
        Box::new(ResourceSetCannotChange),
    ]
}

fn pod_field(pod: &str) -> String {
    format!("PodSpec[{pod}]")
}

fn task_field(pod: &str, task: &str) -> String {
    format!("PodSpec[{pod}].TaskSpec[{task}]")
}

/// Pods present in both specs, paired by name.
fn common_pods<'a>(
    old: &'a ServiceSpec,
    new: &'a ServiceSpec,
) -> impl Iterator<Item = (&'a PodSpec, &'a PodSpec)> {
    old.pods
        .iter()
        .filter_map(|o| new.pod(&o.name).map(|n| (o, n)))
}

// ── Isolation ──────────────────────────────────────────────────────

/// Checks a spec on its own: names, uniqueness, and resource values.
pub struct SpecIsolationValidator {
    capabilities: Capabilities,
}

impl SpecIsolationValidator {
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    fn check_name(field: &str, name: &str, errors: &mut Vec<ConfigValidationError>) {
        if name.is_empty() {
            errors.push(ConfigValidationError::value(field, name, "Name must not be empty"));
        } else if name.contains('/') || name.contains("__") {
            errors.push(ConfigValidationError::value(
                field,
                name,
                "Name must not contain '/' or '__'",
            ));
        }
    }

    fn check_amount(
        field: &str,
        amount: f64,
        positive: bool,
        errors: &mut Vec<ConfigValidationError>,
    ) {
        let valid = amount.is_finite() && if positive { amount > 0.0 } else { amount >= 0.0 };
        if !valid {
            let expected = if positive { "positive" } else { "non-negative" };
            errors.push(ConfigValidationError::value(
                field,
                amount,
                &format!("Resource amount must be finite and {expected}"),
            ));
        }
    }

    fn check_task(&self, pod: &PodSpec, task: &TaskSpec, errors: &mut Vec<ConfigValidationError>) {
        let field = task_field(&pod.name, &task.name);
        Self::check_name(&format!("{field}.name"), &task.name, errors);
        if task.command.trim().is_empty() {
            errors.push(ConfigValidationError::value(
                &format!("{field}.command"),
                &task.command,
                "Command must not be empty",
            ));
        }

        let res = &task.resources;
        Self::check_amount(&format!("{field}.cpus"), res.cpus, true, errors);
        Self::check_amount(&format!("{field}.mem"), res.mem, true, errors);
        Self::check_amount(&format!("{field}.disk"), res.disk, false, errors);
        Self::check_amount(&format!("{field}.gpus"), res.gpus, false, errors);
        if res.gpus > 0.0 && !self.capabilities.supports_gpu_resources {
            errors.push(ConfigValidationError::value(
                &format!("{field}.gpus"),
                res.gpus,
                "GPU resources are not supported by this cluster",
            ));
        }

        let mut port_names = HashSet::new();
        for port in &res.ports {
            if !port_names.insert(port.name.as_str()) {
                errors.push(ConfigValidationError::value(
                    &format!("{field}.ports"),
                    &port.name,
                    "Port names must be unique within a task",
                ));
            }
        }

        let mut paths = HashSet::new();
        for volume in &task.volumes {
            Self::check_amount(
                &format!("{field}.volume[{}]", volume.container_path),
                volume.size,
                true,
                errors,
            );
            if volume.container_path.is_empty() || !paths.insert(volume.container_path.as_str()) {
                errors.push(ConfigValidationError::value(
                    &format!("{field}.volumes"),
                    &volume.container_path,
                    "Volume container paths must be non-empty and unique",
                ));
            }
        }

        if task.readiness_check.is_some() && !self.capabilities.supports_readiness_checks {
            errors.push(ConfigValidationError::value(
                &format!("{field}.readiness_check"),
                "present",
                "Readiness checks are not supported by this cluster",
            ));
        }
    }
}

impl ConfigValidator for SpecIsolationValidator {
    fn validate(&self, _old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        Self::check_name("ServiceSpec.name", &new.name, &mut errors);
        if new.role.is_empty() {
            errors.push(ConfigValidationError::value(
                "ServiceSpec.role",
                &new.role,
                "Role must not be empty",
            ));
        }

        let mut pod_names = HashSet::new();
        for pod in &new.pods {
            let field = pod_field(&pod.name);
            Self::check_name(&format!("{field}.name"), &pod.name, &mut errors);
            if !pod_names.insert(pod.name.as_str()) {
                errors.push(ConfigValidationError::value(
                    "ServiceSpec.pods",
                    &pod.name,
                    "Pod names must be unique",
                ));
            }
            if pod.tasks.is_empty() {
                errors.push(ConfigValidationError::value(
                    &format!("{field}.tasks"),
                    0,
                    "Pods must declare at least one task",
                ));
            }

            Self::check_amount(&format!("{field}.executor.cpus"), pod.executor.cpus, false, &mut errors);
            Self::check_amount(&format!("{field}.executor.mem"), pod.executor.mem, false, &mut errors);
            Self::check_amount(&format!("{field}.executor.disk"), pod.executor.disk, false, &mut errors);

            let mut task_names = HashSet::new();
            for task in &pod.tasks {
                if !task_names.insert(task.name.as_str()) {
                    errors.push(ConfigValidationError::value(
                        &format!("{field}.tasks"),
                        &task.name,
                        "Task names must be unique within a pod",
                    ));
                }
                self.check_task(pod, task, &mut errors);
            }
        }
        errors
    }
}

// ── Transitions ────────────────────────────────────────────────────

pub struct ServiceNameCannotChange;

impl ConfigValidator for ServiceNameCannotChange {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        match old {
            Some(old) if old.name != new.name => vec![ConfigValidationError::transition(
                "ServiceSpec.name",
                &old.name,
                &new.name,
                "Service name cannot change",
            )],
            _ => Vec::new(),
        }
    }
}

/// The service user and every pod user must stay the same.
pub struct UserCannotChange;

impl ConfigValidator for UserCannotChange {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        let Some(old) = old else {
            return Vec::new();
        };
        let show = |user: &Option<String>| user.clone().unwrap_or_default();
        let mut errors = Vec::new();
        if old.user != new.user {
            errors.push(ConfigValidationError::transition(
                "ServiceSpec.user",
                show(&old.user),
                show(&new.user),
                "Service user cannot change",
            ));
        }
        for (o, n) in common_pods(old, new) {
            if o.user != n.user {
                errors.push(ConfigValidationError::transition(
                    &format!("{}.user", pod_field(&o.name)),
                    show(&o.user),
                    show(&n.user),
                    "Pod user cannot change",
                ));
            }
        }
        errors
    }
}

/// Pods may only lose instances when decommissioning is allowed.
///
/// A shrink is judged by the new pod's flag, a removal by the old one's.
pub struct PodSpecsCannotShrink;

impl ConfigValidator for PodSpecsCannotShrink {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        let Some(old) = old else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        for o in &old.pods {
            match new.pod(&o.name) {
                Some(n) if n.count < o.count && !n.allow_decommission => {
                    errors.push(ConfigValidationError::transition(
                        &pod_field(&o.name),
                        o.count,
                        n.count,
                        "Pod count cannot shrink unless allow_decommission is set",
                    ));
                }
                None if !o.allow_decommission => {
                    errors.push(ConfigValidationError::transition(
                        &pod_field(&o.name),
                        o.count,
                        0,
                        "Pod cannot be removed unless allow_decommission is set",
                    ));
                }
                _ => {}
            }
        }
        errors
    }
}

/// Persistent volumes of an existing task are fixed.
pub struct TaskVolumesCannotChange;

impl ConfigValidator for TaskVolumesCannotChange {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        let Some(old) = old else {
            return Vec::new();
        };
        let describe = |task: &TaskSpec| {
            task.volumes
                .iter()
                .map(|v| format!("{}:{}", v.container_path, v.size))
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut errors = Vec::new();
        for (o, n) in common_pods(old, new) {
            for old_task in &o.tasks {
                let Some(new_task) = n.task(&old_task.name) else {
                    continue;
                };
                if old_task.volumes != new_task.volumes {
                    errors.push(ConfigValidationError::transition(
                        &format!("{}.volumes", task_field(&o.name, &old_task.name)),
                        describe(old_task),
                        describe(new_task),
                        "Volumes cannot change",
                    ));
                }
            }
        }
        errors
    }
}

/// Reservations are keyed by resource set, so a pod's set is fixed.
pub struct ResourceSetCannotChange;

impl ConfigValidator for ResourceSetCannotChange {
    fn validate(&self, old: Option<&ServiceSpec>, new: &ServiceSpec) -> Vec<ConfigValidationError> {
        let Some(old) = old else {
            return Vec::new();
        };
        common_pods(old, new)
            .filter(|(o, n)| o.resource_set_id() != n.resource_set_id())
            .map(|(o, n)| {
                ConfigValidationError::transition(
                    &format!("{}.resource_set", pod_field(&o.name)),
                    o.resource_set_id(),
                    n.resource_set_id(),
                    "Resource set cannot change",
                )
            })
            .collect()
    }
}
