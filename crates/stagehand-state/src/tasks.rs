//! StateStore — launched tasks, their latest status, and per-task properties.
//!
//! Layout under the persister:
//!
//! ```text
//! Tasks/<task-name>/info       TaskInfo (JSON)
//! Tasks/<task-name>/status     latest TaskStatus (JSON)
//! Tasks/<task-name>/<property> opaque bytes
//! ```

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use stagehand_core::{TaskInfo, TaskStatus};

use crate::error::{StateError, StateResult};
use crate::persister::{Persister, join};

const TASKS_ROOT: &str = "Tasks";
const INFO: &str = "info";
const STATUS: &str = "status";

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn task_path(task_name: &str) -> String {
    join(TASKS_ROOT, task_name)
}

#[derive(Clone)]
pub struct StateStore {
    persister: Arc<dyn Persister>,
}

impl StateStore {
    pub fn new(persister: Arc<dyn Persister>) -> Self {
        Self { persister }
    }

    fn read_json<T: DeserializeOwned>(&self, path: &str) -> StateResult<Option<T>> {
        match self.persister.get(path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, path: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.persister.set(path, &bytes)
    }

    // ── Task infos ─────────────────────────────────────────────────

    /// Insert or replace the info records of the given tasks.
    pub fn store_tasks(&self, tasks: &[TaskInfo]) -> StateResult<()> {
        for task in tasks {
            self.write_json(&join(&task_path(&task.name), INFO), task)?;
            debug!(task = %task.name, task_id = %task.task_id, "task info stored");
        }
        Ok(())
    }

    pub fn fetch_task(&self, task_name: &str) -> StateResult<Option<TaskInfo>> {
        self.read_json(&join(&task_path(task_name), INFO))
    }

    /// Names of every task with a stored record.
    pub fn fetch_task_names(&self) -> StateResult<Vec<String>> {
        self.persister.children(TASKS_ROOT)
    }

    pub fn fetch_tasks(&self) -> StateResult<Vec<TaskInfo>> {
        let mut tasks = Vec::new();
        for name in self.fetch_task_names()? {
            if let Some(task) = self.fetch_task(&name)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Erase a task's info, status, and properties.
    pub fn delete_task(&self, task_name: &str) -> StateResult<()> {
        let removed = self.persister.delete_all(&task_path(task_name))?;
        info!(task = %task_name, removed, "task record deleted");
        Ok(())
    }

    // ── Statuses ───────────────────────────────────────────────────

    /// Store the latest status for a task and return what was written.
    ///
    /// The task must already have an info record with the same task id. An
    /// update without network information keeps the previous status's.
    pub fn store_status(&self, task_name: &str, status: &TaskStatus) -> StateResult<TaskStatus> {
        let info = self
            .fetch_task(task_name)?
            .ok_or_else(|| StateError::NotFound(format!("task info for {task_name}")))?;
        if info.task_id != status.task_id {
            return Err(StateError::Inconsistent(format!(
                "status task id {} does not match stored task id {} for {task_name}",
                status.task_id, info.task_id
            )));
        }

        let merged = match self.fetch_status(task_name)? {
            Some(previous) => status.clone().inherit_network_from(&previous),
            None => status.clone(),
        };
        self.write_json(&join(&task_path(task_name), STATUS), &merged)?;
        debug!(task = %task_name, state = %merged.state, "task status stored");
        Ok(merged)
    }

    pub fn fetch_status(&self, task_name: &str) -> StateResult<Option<TaskStatus>> {
        self.read_json(&join(&task_path(task_name), STATUS))
    }

    pub fn fetch_statuses(&self) -> StateResult<Vec<TaskStatus>> {
        let mut statuses = Vec::new();
        for name in self.fetch_task_names()? {
            if let Some(status) = self.fetch_status(&name)? {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    // ── Properties ─────────────────────────────────────────────────

    fn check_property_key(key: &str) -> StateResult<()> {
        if key.is_empty() || key == INFO || key == STATUS || key.contains('/') {
            return Err(StateError::InvalidPath(format!("reserved property key: {key}")));
        }
        Ok(())
    }

    pub fn store_property(&self, task_name: &str, key: &str, value: &[u8]) -> StateResult<()> {
        Self::check_property_key(key)?;
        if self.fetch_task(task_name)?.is_none() {
            return Err(StateError::NotFound(format!("task info for {task_name}")));
        }
        self.persister.set(&join(&task_path(task_name), key), value)
    }

    pub fn fetch_property(&self, task_name: &str, key: &str) -> StateResult<Option<Vec<u8>>> {
        Self::check_property_key(key)?;
        self.persister.get(&join(&task_path(task_name), key))
    }

    pub fn clear_property(&self, task_name: &str, key: &str) -> StateResult<()> {
        Self::check_property_key(key)?;
        self.persister.delete_all(&join(&task_path(task_name), key))?;
        Ok(())
    }
}
