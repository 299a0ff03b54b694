//! Service specification types.
//!
//! A [`ServiceSpec`] is the declarative description of a service: its pods,
//! each pod's instance count, and the tasks that run together in every pod
//! instance. Specs are loaded from TOML and persisted as JSON by the config
//! store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Identifier of a stored service configuration.
pub type ConfigId = Uuid;

/// Default role reservations are made under.
pub const DEFAULT_ROLE: &str = "stagehand-role";

/// Default principal reservations are made by.
pub const DEFAULT_PRINCIPAL: &str = "stagehand-principal";

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

fn default_principal() -> String {
    DEFAULT_PRINCIPAL.to_string()
}

/// Declarative description of a whole service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_principal")]
    pub principal: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pods: Vec<PodSpec>,
}

impl ServiceSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: default_role(),
            principal: default_principal(),
            user: None,
            pods: Vec::new(),
        }
    }

    pub fn with_pod(mut self, pod: PodSpec) -> Self {
        self.pods.push(pod);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Parse a spec from a TOML document.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a spec from a TOML file on disk.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Look up a pod by its type name.
    pub fn pod(&self, pod_type: &str) -> Option<&PodSpec> {
        self.pods.iter().find(|p| p.name == pod_type)
    }

    pub fn pod_mut(&mut self, pod_type: &str) -> Option<&mut PodSpec> {
        self.pods.iter_mut().find(|p| p.name == pod_type)
    }
}

/// Ordering of steps inside a deployment phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One step at a time, in declaration order.
    #[default]
    Serial,
    /// Every eligible step at once.
    Parallel,
}

/// Resources reserved for the executor hosting a pod instance's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

impl Default for ExecutorSpec {
    fn default() -> Self {
        Self {
            cpus: 0.1,
            mem: 32.0,
            disk: 256.0,
        }
    }
}

/// A named group of tasks that are co-located and launched together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Pod type, e.g. `"POD-A"`.
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub allow_decommission: bool,
    #[serde(default)]
    pub resource_set: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub executor: ExecutorSpec,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl PodSpec {
    pub fn new(name: &str, count: u32) -> Self {
        Self {
            name: name.to_string(),
            count,
            allow_decommission: false,
            resource_set: None,
            user: None,
            strategy: Strategy::Serial,
            executor: ExecutorSpec::default(),
            tasks: Vec::new(),
        }
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_decommission(mut self, allow: bool) -> Self {
        self.allow_decommission = allow;
        self
    }

    /// Identifier keying the reservations shared by this pod's tasks.
    pub fn resource_set_id(&self) -> String {
        self.resource_set
            .clone()
            .unwrap_or_else(|| format!("{}-resource-set", self.name))
    }

    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn instance(&self, index: u32) -> PodInstance {
        PodInstance::new(&self.name, index)
    }
}

/// Desired end state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    /// Long-running: should stay RUNNING.
    #[default]
    Running,
    /// Run to completion: TASK_FINISHED is success.
    Finish,
}

/// One process inside a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub goal: GoalState,
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub image: Option<String>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub readiness_check: Option<ReadinessCheckSpec>,
}

impl TaskSpec {
    pub fn new(name: &str, command: &str, cpus: f64, mem: f64) -> Self {
        Self {
            name: name.to_string(),
            goal: GoalState::Running,
            command: command.to_string(),
            env: BTreeMap::new(),
            image: None,
            resources: ResourceSpec {
                cpus,
                mem,
                ..ResourceSpec::default()
            },
            volumes: Vec::new(),
            health_check: None,
            readiness_check: None,
        }
    }

    pub fn with_volume(mut self, container_path: &str, size: f64) -> Self {
        self.volumes.push(VolumeSpec {
            container_path: container_path.to_string(),
            size,
        });
        self
    }

    pub fn with_port(mut self, name: &str, port: u64) -> Self {
        self.resources.ports.push(PortSpec {
            name: name.to_string(),
            port,
        });
        self
    }

    pub fn with_goal(mut self, goal: GoalState) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_readiness_check(mut self, command: &str) -> Self {
        self.readiness_check = Some(ReadinessCheckSpec {
            command: command.to_string(),
            interval_secs: 5,
            delay_secs: 0,
            timeout_secs: 10,
        });
        self
    }
}

/// Scalar and range resources a task needs, excluding persistent volumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpus: f64,
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    #[serde(default)]
    pub gpus: f64,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// A named port. Port `0` means any free port from the offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(default)]
    pub port: u64,
}

/// A persistent volume mounted into the task's sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub container_path: String,
    /// Size in megabytes.
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub command: String,
    pub interval_secs: u64,
    pub grace_period_secs: u64,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheckSpec {
    pub command: String,
    pub interval_secs: u64,
    pub delay_secs: u64,
    pub timeout_secs: u64,
}

/// How a launch relates to previously launched tasks of the same instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryType {
    /// Initial deployment or a config update.
    #[default]
    None,
    /// Relaunch in place, reusing the existing reservations.
    Transient,
    /// Relaunch from scratch with fresh reservations.
    Permanent,
}

/// One instance of a pod type, identified by its index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodInstance {
    pub pod_type: String,
    pub index: u32,
}

impl PodInstance {
    pub fn new(pod_type: &str, index: u32) -> Self {
        Self {
            pod_type: pod_type.to_string(),
            index,
        }
    }

    /// Name of the task `task` inside this instance, e.g. `POD-A-0-A`.
    pub fn task_name(&self, task: &str) -> String {
        format!("{self}-{task}")
    }
}

impl fmt::Display for PodInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pod_type, self.index)
    }
}
