//! Identifier construction and parsing.
//!
//! Task ids embed the task name so a status update can be routed back to
//! its stored task record: `<task-name>__<uuid>`.

use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

const TASK_ID_SEPARATOR: &str = "__";

/// Create a fresh task id for the named task.
pub fn new_task_id(task_name: &str) -> String {
    format!("{task_name}{TASK_ID_SEPARATOR}{}", Uuid::new_v4())
}

/// Recover the task name from a task id.
pub fn task_name_from_id(task_id: &str) -> CoreResult<&str> {
    match task_id.rsplit_once(TASK_ID_SEPARATOR) {
        Some((name, suffix)) if !name.is_empty() && Uuid::parse_str(suffix).is_ok() => Ok(name),
        _ => Err(CoreError::InvalidTaskId(task_id.to_string())),
    }
}

pub fn new_executor_id(executor_name: &str) -> String {
    format!("{executor_name}{TASK_ID_SEPARATOR}{}", Uuid::new_v4())
}

pub fn new_resource_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_persistence_id() -> String {
    Uuid::new_v4().to_string()
}
