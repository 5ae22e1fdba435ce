//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent asynchronous commands
    pub max_workers: usize,

    /// How long a polled external task stays locked to its worker
    #[serde(with = "duration_millis")]
    pub lock_duration: Duration,

    /// Interval of the expired-lock sweep
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Maximum timed-out tasks re-run per sweep
    pub sweep_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            lock_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            sweep_batch_size: 100,
        }
    }
}

impl EngineConfig {
    /// Load overrides from `PROCFLOW_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_workers = env_parse("PROCFLOW_MAX_WORKERS").unwrap_or(defaults.max_workers);
        let lock_duration = env_parse("PROCFLOW_LOCK_DURATION_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_duration);
        let sweep_interval = env_parse("PROCFLOW_SWEEP_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.sweep_interval);
        let sweep_batch_size =
            env_parse("PROCFLOW_SWEEP_BATCH_SIZE").unwrap_or(defaults.sweep_batch_size);

        Self {
            max_workers: max_workers.max(1),
            lock_duration,
            sweep_interval,
            sweep_batch_size,
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.lock_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder_clamps_workers() {
        let config = EngineConfig::default()
            .with_max_workers(0)
            .with_sweep_batch_size(5);
        assert_eq!(config.max_workers, 1);
        assert_eq!(config.sweep_batch_size, 5);
    }

    #[test]
    fn test_config_serializes_millis() {
        let config = EngineConfig::default().with_lock_duration(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lock_duration"], 1500);

        let back: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
