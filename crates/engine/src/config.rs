//! Engine tuning knobs. Grounded in the teacher's worker-pool config
//! shape (`worker_count`, `max_queue_size`, `default_timeout_secs`),
//! extended with the poller tick and sync-waiter poll intervals this
//! runtime's scheduling model needs. Per-job timeouts come from the
//! Settings table via `loom_core::model::parse_timeout_setting`, not
//! from this struct — those are data, not deployment configuration.

use std::time::Duration;

/// Deployment-time tuning for the scheduler. Everything here has a
/// sensible default; override via `EngineConfig::from_env`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks pulling from the job channel.
    pub worker_count: usize,
    /// Bounded job channel capacity — the backpressure point between
    /// the poller and the workers.
    pub max_queue_size: usize,
    /// How often the poller checks the Job Store for queued work.
    pub poll_interval: Duration,
    /// How often the synchronous waiter re-checks a job's status.
    pub waiter_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 100,
            poll_interval: Duration::from_secs(1),
            waiter_poll_interval: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load overrides from `LOOM_WORKER_COUNT` / `LOOM_MAX_QUEUE_SIZE`,
    /// falling back to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("LOOM_WORKER_COUNT") {
            if let Ok(value) = raw.parse() {
                config.worker_count = value;
            }
        }
        if let Ok(raw) = std::env::var("LOOM_MAX_QUEUE_SIZE") {
            if let Ok(value) = raw.parse() {
                config.max_queue_size = value;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_scheduling_model() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.waiter_poll_interval, Duration::from_millis(500));
    }
}
