use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::broker::priority::PriorityDistribution;
use crate::runner::error::WorkerError;

/// Worker-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of messages processed at once.
    pub tasks_concurrency_limit: usize,
    /// Stop consuming once this many messages were processed or are in flight.
    pub max_tasks: Option<usize>,
    pub prefetch: usize,
    pub maintenance_interval_seconds: u64,
    /// How long `run_until_shutdown` waits for in-flight tasks before cancelling them.
    pub graceful_shutdown_seconds: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tasks_concurrency_limit: 10,
            max_tasks: None,
            prefetch: 1,
            maintenance_interval_seconds: 30,
            graceful_shutdown_seconds: 25,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.tasks_concurrency_limit == 0 {
            return Err(WorkerError::Config(
                "tasks_concurrency_limit must be > 0".into(),
            ));
        }
        if self.prefetch == 0 {
            return Err(WorkerError::Config("prefetch must be > 0".into()));
        }
        if self.max_tasks == Some(0) {
            return Err(WorkerError::Config("max_tasks must be > 0 when set".into()));
        }
        Ok(())
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds.max(1))
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_seconds)
    }
}

/// Queueing-engine settings shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// HIGH/MEDIUM/LOW weights, e.g. `"10/3/1"`.
    pub priorities_distribution: String,
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Namespace for every Redis key.
    pub key_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            priorities_distribution: "10/3/1".to_string(),
            min_poll_interval_ms: 10,
            max_poll_interval_ms: 1000,
            key_prefix: "dq".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn distribution(&self) -> Result<PriorityDistribution, WorkerError> {
        self.priorities_distribution.parse()
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms).max(self.min_poll_interval())
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        self.distribution()?;
        if self.key_prefix.is_empty() {
            return Err(WorkerError::Config("key_prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.tasks_concurrency_limit, 10);
        assert_eq!(config.prefetch, 1);
        assert!(config.validate().is_ok());
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"tasks_concurrency_limit": 4, "max_tasks": 100}"#).unwrap();
        assert_eq!(config.tasks_concurrency_limit, 4);
        assert_eq!(config.max_tasks, Some(100));
        assert_eq!(config.maintenance_interval_seconds, 30);
    }

    #[test]
    fn rejects_zero_limits() {
        let config = RunnerConfig {
            tasks_concurrency_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(WorkerError::Config(_))));
        let broker = BrokerConfig {
            priorities_distribution: "1/2".into(),
            ..Default::default()
        };
        assert!(broker.validate().is_err());
    }
}
