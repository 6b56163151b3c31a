//! Engine configuration and the shared port-handle bundle.

use crucible_core::ports::{
    BuildRepository, CommandRepository, FailureReasonRepository, JobRepository, LeaseLock,
    PhaseRepository, SignalBus, StepRepository, TaskQueue, TaskRepository, TestStatsProvider,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Tunables for the sync loop and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Delay between sync polls of an unfinished entity.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Job/step timeout applied when the plan does not set one.
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u32,

    /// Replacement links allowed per step chain before a failure stands.
    #[serde(default = "default_max_step_replacements")]
    pub max_step_replacements: u32,

    /// Lease TTL for the per-step expansion guard.
    #[serde(default = "default_expansion_lock_ttl_secs")]
    pub expansion_lock_ttl_secs: u64,

    /// Handler failures tolerated before the abort handler runs.
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    /// Delay before redelivering a failed task.
    #[serde(default = "default_retry_countdown_secs")]
    pub retry_countdown_secs: u64,

    /// Heartbeat silence tolerated before a running step is declared lost.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_timeout_minutes() -> u32 {
    90
}

fn default_max_step_replacements() -> u32 {
    2
}

fn default_expansion_lock_ttl_secs() -> u64 {
    60
}

fn default_max_task_retries() -> u32 {
    100
}

fn default_retry_countdown_secs() -> u64 {
    60
}

fn default_heartbeat_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            default_timeout_minutes: default_timeout_minutes(),
            max_step_replacements: default_max_step_replacements(),
            expansion_lock_ttl_secs: default_expansion_lock_ttl_secs(),
            max_task_retries: default_max_task_retries(),
            retry_countdown_secs: default_retry_countdown_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn expansion_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.expansion_lock_ttl_secs)
    }

    pub fn retry_countdown(&self) -> Duration {
        Duration::from_secs(self.retry_countdown_secs)
    }
}

/// Port handles threaded through one sync operation.
///
/// Short-lived and cheap to clone; passed explicitly down the call chain
/// instead of living in globals.
#[derive(Clone)]
pub struct EngineContext {
    pub builds: Arc<dyn BuildRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub phases: Arc<dyn PhaseRepository>,
    pub steps: Arc<dyn StepRepository>,
    pub commands: Arc<dyn CommandRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub failures: Arc<dyn FailureReasonRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub locks: Arc<dyn LeaseLock>,
    pub signals: Arc<dyn SignalBus>,
    pub test_stats: Arc<dyn TestStatsProvider>,
    pub config: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.default_timeout_minutes, 90);
        assert_eq!(config.max_step_replacements, 2);
    }

    #[test]
    fn test_config_partial_deserialize() {
        let config: EngineConfig = serde_json::from_str(r#"{"poll_interval_secs": 1}"#).unwrap();
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.max_task_retries, 100);
    }
}
