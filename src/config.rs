//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::worker::Interval;

/// Environment variable overriding [`PoolConfig::max_threads`].
pub const ENV_MAX_THREADS: &str = "WORKER_POOL_MAX_THREADS";
/// Environment variable overriding [`PoolConfig::keep_alive`], in milliseconds.
pub const ENV_KEEP_ALIVE_MS: &str = "WORKER_POOL_KEEP_ALIVE_MS";

/// Sizing of the default background pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently live pool threads. The pool grows to this
    /// many threads before any work is queued.
    pub max_threads: usize,
    /// Idle time after which a pool thread exits.
    pub keep_alive: Duration,
    /// Prefix for pool thread names; a counter is appended.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_threads: 32,
            keep_alive: Duration::from_secs(1),
            thread_name_prefix: "worker-pool-thread".to_string(),
        }
    }
}

impl PoolConfig {
    /// Defaults, overridden by `WORKER_POOL_MAX_THREADS` and
    /// `WORKER_POOL_KEEP_ALIVE_MS` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_THREADS) {
            let max_threads: usize = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_MAX_THREADS.to_string(),
                message: format!("{e}"),
            })?;
            if max_threads == 0 {
                return Err(ConfigError::InvalidValue {
                    key: ENV_MAX_THREADS.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_threads = max_threads;
        }

        if let Some(raw) = lookup(ENV_KEEP_ALIVE_MS) {
            let millis: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: ENV_KEEP_ALIVE_MS.to_string(),
                message: format!("{e}"),
            })?;
            config.keep_alive = Duration::from_millis(millis);
        }

        Ok(config)
    }
}

/// Initial schedule of a [`ScheduledService`](crate::worker::ScheduledService).
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Wait before the first run of a fresh start.
    pub delay: Interval,
    /// Minimum spacing between the starts of two consecutive runs.
    pub period: Interval,
    /// Upper bound for the backed-off period.
    pub maximum_cumulative_period: Interval,
    /// Whether a failed run schedules another iteration.
    pub restart_on_failure: bool,
    /// Number of failures after which the service stays `FAILED`.
    pub maximum_failure_count: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            delay: Interval::ZERO,
            period: Interval::ZERO,
            maximum_cumulative_period: Interval::Indefinite,
            restart_on_failure: true,
            maximum_failure_count: u32::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn pool_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_threads, 32);
        assert_eq!(config.keep_alive, Duration::from_secs(1));
    }

    #[test]
    fn pool_env_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            (ENV_MAX_THREADS, "4"),
            (ENV_KEEP_ALIVE_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.keep_alive, Duration::from_millis(250));
    }

    #[test]
    fn pool_rejects_zero_threads() {
        let err = PoolConfig::from_lookup(lookup(&[(ENV_MAX_THREADS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == ENV_MAX_THREADS));
    }

    #[test]
    fn pool_rejects_garbage() {
        assert!(PoolConfig::from_lookup(lookup(&[(ENV_KEEP_ALIVE_MS, "soon")])).is_err());
    }

    #[test]
    fn schedule_defaults() {
        let config = ScheduleConfig::default();
        assert!(config.restart_on_failure);
        assert_eq!(config.maximum_failure_count, u32::MAX);
        assert_eq!(config.maximum_cumulative_period, Interval::Indefinite);
    }
}
