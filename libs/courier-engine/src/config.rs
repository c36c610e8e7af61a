use std::time::Duration;

use serde::Deserialize;

use crate::error::EngineError;

/// Tuning of the consumption coordinator (`[coordinator]` in the worker config).
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Size of the handler worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the channel between the pull loop and the pool.
    /// Defaults to `workers`.
    #[serde(default)]
    pub queue_depth: Option<usize>,
    /// Bounded drain: handlers still running after this long are aborted
    /// and the session ends with `EngineError::DrainTimeout`.
    #[serde(default)]
    pub drain_timeout_ms: Option<u64>,
    /// A retryable failure at this delivery attempt (or later) is treated as
    /// a poison message. Only effective when the broker reports attempts.
    #[serde(default)]
    pub max_delivery_attempts: Option<u32>,
    /// Pause after a transient pull error.
    #[serde(default = "default_pull_backoff_ms")]
    pub pull_backoff_ms: u64,
    /// Most recent poison records kept for the session report.
    #[serde(default = "default_poison_log_capacity")]
    pub poison_log_capacity: usize,
}

fn default_workers() -> usize {
    8
}
fn default_pull_backoff_ms() -> u64 {
    1000
}
fn default_poison_log_capacity() -> usize {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: None,
            drain_timeout_ms: None,
            max_delivery_attempts: None,
            pull_backoff_ms: default_pull_backoff_ms(),
            poison_log_capacity: default_poison_log_capacity(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("coordinator.workers must be at least 1".into()));
        }
        if self.queue_depth == Some(0) {
            return Err(EngineError::Config("coordinator.queue_depth must be at least 1".into()));
        }
        if self.max_delivery_attempts == Some(0) {
            return Err(EngineError::Config(
                "coordinator.max_delivery_attempts must be at least 1".into(),
            ));
        }
        if self.drain_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "coordinator.drain_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.workers)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn pull_backoff(&self) -> Duration {
        Duration::from_millis(self.pull_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let c: CoordinatorConfig = toml::from_str("").unwrap();
        assert_eq!(c.workers, 8);
        assert_eq!(c.queue_depth(), 8);
        assert_eq!(c.drain_timeout(), None);
        assert_eq!(c.pull_backoff(), Duration::from_secs(1));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn explicit_values_are_kept() {
        let c: CoordinatorConfig = toml::from_str(
            "workers = 2\nqueue_depth = 16\ndrain_timeout_ms = 30000\nmax_delivery_attempts = 5",
        )
        .unwrap();
        assert_eq!(c.queue_depth(), 16);
        assert_eq!(c.drain_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.max_delivery_attempts, Some(5));
    }

    #[test]
    fn zero_values_are_rejected() {
        for bad in [
            "workers = 0",
            "queue_depth = 0",
            "max_delivery_attempts = 0",
            "drain_timeout_ms = 0",
        ] {
            let c: CoordinatorConfig = toml::from_str(bad).unwrap();
            assert!(matches!(c.validate(), Err(EngineError::Config(_))), "{bad}");
        }
    }
}
