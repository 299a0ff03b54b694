//! Scheduler error types.

use thiserror::Error;

use crate::validation::ConfigValidationError;

/// Errors that can occur while building or running the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("state store error: {0}")]
    State(#[from] stagehand_state::StateError),

    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ConfigValidationError>),

    #[error("failed to load scheduler config: {0}")]
    Config(String),

    #[error("pod instance not found: {0}")]
    PodNotFound(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether retrying the same event may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::State(_))
    }
}

fn join_errors(errors: &[ConfigValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
