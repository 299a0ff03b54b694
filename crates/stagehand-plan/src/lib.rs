//! stagehand-plan — plans, phases, and steps.
//!
//! # Architecture
//!
//! ```text
//! PlanCoordinator (priority: recovery > deploy > decommission)
//!   └── PlanManager (one per PlanKind)
//!       └── Plan (serial | parallel over phases, plan-level errors)
//!           └── Phase (serial | parallel over steps)
//!               └── Step (Launch | Decommission | Cleanup | NoOp)
//! ```
//!
//! Status flows upward: a phase's status is the aggregate of its steps, a
//! plan's the aggregate of its phases. Steps change status only in response
//! to offer-cycle outcomes and task status updates.

pub mod coordinator;
pub mod manager;
pub mod phase;
pub mod plan;
pub mod status;
pub mod step;

pub use coordinator::{PlanCoordinator, StepKey};
pub use manager::{PlanCustomizer, PlanKind, PlanManager};
pub use phase::Phase;
pub use plan::{DECOMMISSION_PLAN, DEPLOY_PLAN, Plan, RECOVERY_PLAN};
pub use status::{Status, aggregate};
pub use step::{Step, StepKind, TaskTarget};
