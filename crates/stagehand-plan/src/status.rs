//! Execution status shared by steps, phases, and plans.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Failed permanently; only an explicit restart clears it.
    Error,
    /// Blocked on an external event, e.g. a kill being confirmed.
    Waiting,
    /// Not started.
    Pending,
    /// Work was attempted for this step but no offer has been accepted yet.
    Prepared,
    /// Operations accepted; waiting for tasks to run.
    Starting,
    /// Tasks running; waiting for readiness or completion.
    Started,
    Complete,
    /// Aggregate only: some children have progressed, not all are complete.
    InProgress,
}

impl Status {
    /// Whether work for this status has begun but not finished.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Status::Prepared | Status::Starting | Status::Started | Status::InProgress
        )
    }

    /// Whether a step in this status may be handed offers.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Status::Pending | Status::Prepared)
    }

    pub fn is_complete(&self) -> bool {
        *self == Status::Complete
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Error => "ERROR",
            Status::Waiting => "WAITING",
            Status::Pending => "PENDING",
            Status::Prepared => "PREPARED",
            Status::Starting => "STARTING",
            Status::Started => "STARTED",
            Status::Complete => "COMPLETE",
            Status::InProgress => "IN_PROGRESS",
        };
        f.write_str(name)
    }
}

/// Reduce child statuses to the status of their parent.
///
/// An empty parent is complete. Any error wins, then full completion, then
/// any progress (including partial completion), then waiting.
pub fn aggregate(children: impl IntoIterator<Item = Status>) -> Status {
    let mut any = false;
    let mut all_complete = true;
    let mut any_complete = false;
    let mut any_in_progress = false;
    let mut any_waiting = false;
    for status in children {
        any = true;
        match status {
            Status::Error => return Status::Error,
            Status::Complete => any_complete = true,
            s if s.is_in_progress() => any_in_progress = true,
            Status::Waiting => any_waiting = true,
            _ => {}
        }
        all_complete &= status.is_complete();
    }

    if !any || all_complete {
        Status::Complete
    } else if any_in_progress || any_complete {
        Status::InProgress
    } else if any_waiting {
        Status::Waiting
    } else {
        Status::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Status::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(aggregate(std::iter::empty()), Complete);
        assert_eq!(aggregate([Complete, Complete]), Complete);
        assert_eq!(aggregate([Complete, Error, Pending]), Error);
        assert_eq!(aggregate([Pending, Pending]), Pending);
        assert_eq!(aggregate([Pending, Prepared]), InProgress);
        assert_eq!(aggregate([Complete, Pending]), InProgress);
        assert_eq!(aggregate([Waiting, Pending]), Waiting);
        assert_eq!(aggregate([Starting, Waiting]), InProgress);
    }

    #[test]
    fn test_predicates() {
        assert!(Pending.is_eligible());
        assert!(Prepared.is_eligible());
        assert!(!Starting.is_eligible());
        assert!(Prepared.is_in_progress());
        assert!(!Waiting.is_in_progress());
        assert_eq!(Prepared.to_string(), "PREPARED");
    }
}
