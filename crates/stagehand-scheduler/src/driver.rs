//! The cluster-manager driver seam.
//!
//! The scheduler never talks to the resource manager directly; every call
//! goes through an injected [`SchedulerDriver`]. [`RecordingDriver`] keeps
//! the calls in memory and is what tests assert against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use stagehand_core::{Filters, Operation, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver call failed: {0}")]
    Failed(String),
}

/// Calls the scheduler makes on the resource manager.
pub trait SchedulerDriver: Send + Sync {
    fn accept_offers(
        &self,
        offer_ids: &[String],
        operations: &[Operation],
        filters: &Filters,
    ) -> Result<(), DriverError>;

    fn decline_offer(&self, offer_id: &str, filters: &Filters) -> Result<(), DriverError>;

    fn kill_task(&self, task_id: &str) -> Result<(), DriverError>;

    /// Explicit reconciliation for `statuses`, or implicit when empty.
    fn reconcile_tasks(&self, statuses: &[TaskStatus]) -> Result<(), DriverError>;

    fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Accept {
        offer_ids: Vec<String>,
        operations: Vec<Operation>,
        filters: Filters,
    },
    Decline {
        offer_id: String,
        filters: Filters,
    },
    Kill {
        task_id: String,
    },
    Reconcile {
        statuses: Vec<TaskStatus>,
    },
    Acknowledge {
        task_id: String,
    },
}

/// A driver that records every call. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    calls: Arc<Mutex<Vec<DriverCall>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail after being recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, call: DriverCall) -> Result<(), DriverError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DriverError::Failed("recording driver set to fail".into()));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget every recorded call.
    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Operation batches passed to `accept_offers`, in call order.
    pub fn accepts(&self) -> Vec<(Vec<String>, Vec<Operation>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Accept {
                    offer_ids,
                    operations,
                    ..
                } => Some((offer_ids, operations)),
                _ => None,
            })
            .collect()
    }

    pub fn declines(&self) -> Vec<(String, Filters)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id, filters } => Some((offer_id, filters)),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Kill { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    pub fn reconciles(&self) -> Vec<Vec<TaskStatus>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Reconcile { statuses } => Some(statuses),
                _ => None,
            })
            .collect()
    }

    pub fn acknowledgements(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Acknowledge { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }
}

impl SchedulerDriver for RecordingDriver {
    fn accept_offers(
        &self,
        offer_ids: &[String],
        operations: &[Operation],
        filters: &Filters,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Accept {
            offer_ids: offer_ids.to_vec(),
            operations: operations.to_vec(),
            filters: *filters,
        })
    }

    fn decline_offer(&self, offer_id: &str, filters: &Filters) -> Result<(), DriverError> {
        self.record(DriverCall::Decline {
            offer_id: offer_id.to_string(),
            filters: *filters,
        })
    }

    fn kill_task(&self, task_id: &str) -> Result<(), DriverError> {
        self.record(DriverCall::Kill {
            task_id: task_id.to_string(),
        })
    }

    fn reconcile_tasks(&self, statuses: &[TaskStatus]) -> Result<(), DriverError> {
        self.record(DriverCall::Reconcile {
            statuses: statuses.to_vec(),
        })
    }

    fn acknowledge(&self, status: &TaskStatus) -> Result<(), DriverError> {
        self.record(DriverCall::Acknowledge {
            task_id: status.task_id.clone(),
        })
    }
}
