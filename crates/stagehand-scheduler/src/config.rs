//! Scheduler configuration knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_core::Filters;

use crate::error::{SchedulerError, SchedulerResult};

/// What happens when a launched task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Failed tasks get a recovery step automatically.
    #[default]
    Automatic,
    /// Only operator-requested replacements are recovered.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Keep a write-through in-memory copy of persisted state.
    pub state_cache_enabled: bool,
    /// Seconds after registration before reconciliation is forced complete.
    pub reconcile_timeout_secs: u64,
    pub recovery_strategy: RecoveryStrategy,
    /// Re-issue kills for tasks that have not reported a terminal status.
    pub background_kills_enabled: bool,
    pub kill_retry_interval_secs: u64,
    /// Refuse period for offers declined while work remains.
    pub short_decline_secs: f64,
    /// Refuse period for offers declined when every plan is complete.
    pub long_decline_secs: f64,
    pub event_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            state_cache_enabled: true,
            reconcile_timeout_secs: 30,
            recovery_strategy: RecoveryStrategy::Automatic,
            background_kills_enabled: true,
            kill_retry_interval_secs: 5,
            short_decline_secs: 5.0,
            long_decline_secs: 1_209_600.0,
            event_queue_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(content: &str) -> SchedulerResult<Self> {
        toml::from_str(content).map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn with_recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = strategy;
        self
    }

    pub fn with_background_kills(mut self, enabled: bool) -> Self {
        self.background_kills_enabled = enabled;
        self
    }

    pub fn with_state_cache(mut self, enabled: bool) -> Self {
        self.state_cache_enabled = enabled;
        self
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn kill_retry_interval(&self) -> Duration {
        Duration::from_secs(self.kill_retry_interval_secs.max(1))
    }

    pub fn short_decline(&self) -> Filters {
        Filters::refuse_for(self.short_decline_secs)
    }

    pub fn long_decline(&self) -> Filters {
        Filters::refuse_for(self.long_decline_secs)
    }
}

/// Features the cluster supports, consulted when validating specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub supports_gpu_resources: bool,
    pub supports_readiness_checks: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_gpu_resources: true,
            supports_readiness_checks: true,
        }
    }
}
