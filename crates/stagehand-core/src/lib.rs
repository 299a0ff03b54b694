//! stagehand-core — shared types for the Stagehand service scheduler.
//!
//! # Architecture
//!
//! ```text
//! stagehand-core
//!   ├── spec      (ServiceSpec → PodSpec → TaskSpec, loaded from TOML)
//!   ├── protocol  (Offer, Resource, Operation, TaskInfo, TaskStatus)
//!   └── ids       (task / executor / reservation id helpers)
//! ```
//!
//! Every other crate speaks in these types: the state store persists them,
//! the offer evaluator turns specs into operations, and the plan machinery
//! reacts to task statuses.

pub mod error;
pub mod ids;
pub mod protocol;
pub mod spec;

pub use error::{CoreError, CoreResult};
pub use protocol::*;
pub use spec::*;
