//! stagehand-scheduler — the service scheduler.
//!
//! # Architecture
//!
//! ```text
//! EventLoop (mpsc<SchedulerEvent>, kill-retry timer)
//!   └── ServiceScheduler
//!         ├── ConfigManager ── validators ──▶ ConfigStore<ServiceSpec>
//!         ├── PlanCoordinator [recovery, deploy, decommission]
//!         ├── OfferEvaluator / ResourceCleaner
//!         ├── Reconciler, TaskKiller
//!         ├── StateStore / FrameworkStore ──▶ Arc<dyn Persister>
//!         └── Arc<dyn SchedulerDriver> ──▶ resource manager
//! ```
//!
//! The scheduler never talks to the resource manager directly: accepts,
//! declines, kills, reconciliation requests, and acknowledgements all go
//! through [`SchedulerDriver`], which is recorded in tests.

pub mod config;
pub mod config_manager;
pub mod driver;
pub mod error;
pub mod event_loop;
pub mod plans;
pub mod reconciler;
pub mod scheduler;
pub mod task_killer;
pub mod validation;

pub use config::{Capabilities, RecoveryStrategy, SchedulerConfig};
pub use config_manager::{ConfigManager, ConfigUpdate};
pub use driver::{DriverCall, DriverError, RecordingDriver, SchedulerDriver};
pub use error::{SchedulerError, SchedulerResult};
pub use event_loop::{EventLoop, SchedulerEvent};
pub use plans::{PERMANENTLY_FAILED_PROPERTY, StoredTasks};
pub use scheduler::{SchedulerBuilder, ServiceScheduler};
pub use validation::{ConfigValidationError, ConfigValidator, default_validators};
