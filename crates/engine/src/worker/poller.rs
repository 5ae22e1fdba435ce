//! Topic polling for external task workers

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::config::duration_millis;
use crate::engine::{Engine, EngineError};
use crate::persistence::PollRequest;
use crate::runtime::ActivityExecution;

/// How often a worker asks the engine for external tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Delay between polls right after a poll claimed work
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest delay between polls of an idle worker
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the delay after each empty poll; at least 1.0
    pub backoff_multiplier: f64,

    /// Cap on tasks locked from one topic in one poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier)
            .min(self.max_interval)
    }
}

/// Locks external tasks of a worker's topics
///
/// Topics are polled in order and share the `max_tasks` budget of a poll.
/// Every empty poll stretches the delay before the next one; claiming any
/// task brings it back to `min_interval`.
pub struct ExternalTaskPoller {
    engine: Arc<Engine>,
    worker_id: String,
    topics: Vec<String>,
    process_definition_key: Option<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ExternalTaskPoller {
    pub fn new(
        engine: Arc<Engine>,
        worker_id: String,
        topics: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            worker_id,
            topics,
            process_definition_key: None,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Only claim tasks of processes running this definition key
    pub fn with_process_definition_key(mut self, key: Option<String>) -> Self {
        self.process_definition_key = key;
        self
    }

    /// Lock up to `max_tasks` tasks for this worker
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ActivityExecution>, PollerError> {
        if self.is_shutdown() {
            debug!("Worker stopping, poll skipped");
            return Ok(vec![]);
        }

        let mut claimed = Vec::new();
        for topic in &self.topics {
            let budget = max_tasks.saturating_sub(claimed.len());
            if budget == 0 {
                break;
            }
            let mut request =
                PollRequest::new(topic, &self.worker_id, budget.min(self.config.batch_size));
            if let Some(key) = &self.process_definition_key {
                request = request.with_process_definition_key(key);
            }
            let locked = self.engine.poll_external_tasks(&request).await?;
            trace!(topic = %topic, count = locked.len(), "Topic polled");
            claimed.extend(locked);
        }

        self.current_interval = if claimed.is_empty() {
            self.config.next_interval(self.current_interval)
        } else {
            debug!(count = claimed.len(), "External tasks locked");
            self.config.min_interval
        };
        Ok(claimed)
    }

    /// Sleep until the next poll is due; true when the worker is stopping
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Worker stopping, wait cut short");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("external task poll failed: {0}")]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_interval_stops_at_ceiling() {
        let config = PollerConfig::new()
            .with_max_interval(Duration::from_millis(250))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.next_interval(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(config.next_interval(Duration::from_millis(200)), Duration::from_millis(250));
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_until_ceiling() {
        let engine = Arc::new(
            Engine::builder()
                .with_timeout_sweeper(false)
                .build()
                .unwrap(),
        );
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut poller =
            ExternalTaskPoller::new(engine, "w1".into(), vec!["mail".into()], config, rx);

        assert!(poller.poll(5).await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));

        poller.poll(5).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(300));
    }
}
