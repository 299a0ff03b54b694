//! Cluster-manager wire types.
//!
//! These mirror the shapes exchanged with the resource manager: offers of
//! resources on agents, the operations the scheduler performs against an
//! offer, the task descriptions it launches, and the status updates it
//! receives back.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::spec::{ConfigId, GoalState, HealthCheckSpec, PodInstance, ReadinessCheckSpec};

pub const CPUS: &str = "cpus";
pub const MEM: &str = "mem";
pub const DISK: &str = "disk";
pub const GPUS: &str = "gpus";
pub const PORTS: &str = "ports";

/// Status label set by the executor once a task's readiness check passes.
pub const READINESS_CHECK_PASSED_LABEL: &str = "readiness_check_passed";

// ── Resources ──────────────────────────────────────────────────────

/// Inclusive range of integer values, used for ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn single(value: u64) -> Self {
        Self::new(value, value)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.begin <= value && value <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Ranges(Vec<Range>),
}

/// Dynamic reservation metadata attached to a reserved resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub role: String,
    pub principal: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_set: Option<String>,
}

/// Persistent volume metadata carried by a reserved disk resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub persistence_id: String,
    pub container_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub disk: Option<DiskInfo>,
}

impl Resource {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Scalar(value),
            reservation: None,
            disk: None,
        }
    }

    pub fn ranges(name: &str, ranges: Vec<Range>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Ranges(ranges),
            reservation: None,
            disk: None,
        }
    }

    pub fn with_reservation(mut self, reservation: Reservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    pub fn with_disk(mut self, disk: DiskInfo) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self.value {
            Value::Scalar(v) => Some(v),
            Value::Ranges(_) => None,
        }
    }

    pub fn as_ranges(&self) -> Option<&[Range]> {
        match &self.value {
            Value::Ranges(r) => Some(r),
            Value::Scalar(_) => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.reservation.as_ref().map(|r| r.resource_id.as_str())
    }

    pub fn role(&self) -> Option<&str> {
        self.reservation.as_ref().map(|r| r.role.as_str())
    }

    pub fn persistence_id(&self) -> Option<&str> {
        self.disk.as_ref().map(|d| d.persistence_id.as_str())
    }

    pub fn is_volume(&self) -> bool {
        self.disk.is_some()
    }
}

/// Resources on one agent offered to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub resources: Vec<Resource>,
}

impl Offer {
    pub fn new(id: &str, agent_id: &str, resources: Vec<Resource>) -> Self {
        Self {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            hostname: format!("{agent_id}.local"),
            resources,
        }
    }

    pub fn reserved(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| r.is_reserved())
    }
}

/// Decline filter: how long the resource manager should not re-offer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub refuse_seconds: f64,
}

impl Filters {
    pub fn refuse_for(refuse_seconds: f64) -> Self {
        Self { refuse_seconds }
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub name: String,
    pub resources: Vec<Resource>,
}

/// A launched task as handed to the resource manager and kept in the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub name: String,
    pub agent_id: String,
    pub pod_type: String,
    pub pod_index: u32,
    /// Target configuration the task was launched (or last relabelled) under.
    pub target_config: ConfigId,
    pub goal: GoalState,
    pub command: CommandInfo,
    #[serde(default)]
    pub image: Option<String>,
    pub resources: Vec<Resource>,
    pub executor: ExecutorInfo,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub readiness_check: Option<ReadinessCheckSpec>,
}

impl TaskInfo {
    pub fn pod_instance(&self) -> PodInstance {
        PodInstance::new(&self.pod_type, self.pod_index)
    }

    /// Every reservation id this task holds, including its executor's.
    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.resources
            .iter()
            .chain(self.executor.resources.iter())
            .filter_map(Resource::resource_id)
    }

    pub fn persistence_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().filter_map(Resource::persistence_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
    Gone,
    Unreachable,
}

impl TaskState {
    /// Whether the task will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Lost
                | TaskState::Error
                | TaskState::Gone
        )
    }

    /// Whether this state means the task did not reach its goal.
    pub fn is_failure_for(&self, goal: GoalState) -> bool {
        match goal {
            GoalState::Running => self.is_terminal(),
            GoalState::Finish => self.is_terminal() && *self != TaskState::Finished,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Killing => "TASK_KILLING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Lost => "TASK_LOST",
            TaskState::Error => "TASK_ERROR",
            TaskState::Gone => "TASK_GONE",
            TaskState::Unreachable => "TASK_UNREACHABLE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub network_infos: Vec<NetworkInfo>,
}

/// A task state update delivered by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub healthy: Option<bool>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub container_status: Option<ContainerStatus>,
}

impl TaskStatus {
    pub fn new(task_id: &str, state: TaskState) -> Self {
        Self {
            task_id: task_id.to_string(),
            state,
            message: None,
            agent_id: None,
            healthy: None,
            labels: BTreeMap::new(),
            container_status: None,
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.container_status = Some(ContainerStatus {
            network_infos: vec![NetworkInfo {
                ip_addresses: vec![ip.to_string()],
            }],
        });
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_readiness_passed(self) -> Self {
        self.with_label(READINESS_CHECK_PASSED_LABEL, "true")
    }

    /// The ready signal arrives either as the readiness label or as a
    /// passing `healthy` flag. A failing flag never clears the label.
    pub fn readiness_passed(&self) -> bool {
        self.healthy == Some(true)
            || self
                .labels
                .get(READINESS_CHECK_PASSED_LABEL)
                .is_some_and(|v| v == "true")
    }

    pub fn ip_addresses(&self) -> Vec<&str> {
        self.container_status
            .iter()
            .flat_map(|c| c.network_infos.iter())
            .flat_map(|n| n.ip_addresses.iter())
            .map(String::as_str)
            .collect()
    }

    /// Carry the previous status's network info forward when this update has none.
    pub fn inherit_network_from(mut self, previous: &TaskStatus) -> Self {
        if self.ip_addresses().is_empty() && !previous.ip_addresses().is_empty() {
            self.container_status = previous.container_status.clone();
        }
        self
    }
}

// ── Operations ─────────────────────────────────────────────────────

/// An operation performed against an offer when accepting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Reserve { resource: Resource },
    Unreserve { resource: Resource },
    Create { volume: Resource },
    Destroy { volume: Resource },
    LaunchGroup {
        executor: ExecutorInfo,
        tasks: Vec<TaskInfo>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Reserve,
    Unreserve,
    Create,
    Destroy,
    LaunchGroup,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Reserve { .. } => OperationKind::Reserve,
            Operation::Unreserve { .. } => OperationKind::Unreserve,
            Operation::Create { .. } => OperationKind::Create,
            Operation::Destroy { .. } => OperationKind::Destroy,
            Operation::LaunchGroup { .. } => OperationKind::LaunchGroup,
        }
    }
}
