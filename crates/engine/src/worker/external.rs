//! In-process external task worker
//!
//! Polls service tasks by topic, runs a registered handler per task with
//! bounded concurrency and reports the result back to the engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{ExternalTaskPoller, PollerConfig};
use crate::config::duration_millis;
use crate::engine::Engine;
use crate::runtime::{ActivityExecution, Failure};

/// External worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalWorkerConfig {
    /// Lock owner reported to the engine (generated if not provided)
    pub worker_id: String,

    /// Topics this worker handles
    pub topics: Vec<String>,

    /// Only claim tasks of this process definition key
    pub process_definition_key: Option<String>,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ExternalWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            topics: vec![],
            process_definition_key: None,
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ExternalWorkerConfig {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            ..Default::default()
        }
    }

    /// Load overrides from `PROCFLOW_WORKER_*` environment variables
    pub fn from_env(topics: Vec<String>) -> Self {
        let defaults = Self::new(topics);
        Self {
            worker_id: std::env::var("PROCFLOW_WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrency: std::env::var("PROCFLOW_WORKER_MAX_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            ..defaults
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_process_definition_key(mut self, key: impl Into<String>) -> Self {
        self.process_definition_key = Some(key.into());
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Finishing in-flight tasks, not claiming new ones
    Draining,
    Stopped,
}

/// External worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Output variables of a handled task, or the reason it failed
pub type TaskResult = anyhow::Result<Map<String, Value>>;

/// Task handler function type
pub type TaskHandler = Arc<
    dyn Fn(ActivityExecution) -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send + Sync,
>;

/// Polls external tasks and runs them with registered handlers
///
/// ```ignore
/// let worker = ExternalTaskWorker::new(engine, ExternalWorkerConfig::new(vec!["mail".into()]));
/// worker.register_handler("mail", |task| async move {
///     send_mail(&task.variables).await?;
///     Ok(Map::new())
/// });
/// worker.start()?;
/// ```
pub struct ExternalTaskWorker {
    engine: Arc<Engine>,
    config: ExternalWorkerConfig,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExternalTaskWorker {
    pub fn new(engine: Arc<Engine>, config: ExternalWorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Register the handler of a topic
    pub fn register_handler<F, Fut>(&self, topic: &str, handler: F)
    where
        F: Fn(ActivityExecution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |task| Box::pin(handler(task)));
        self.handlers.write().insert(topic.to_string(), handler);
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Tasks currently being handled
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Start the poll loop
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        info!(
            topics = ?self.config.topics,
            max_concurrency = self.config.max_concurrency,
            "Starting external task worker"
        );
        let handle = self.spawn_poll_loop();
        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming tasks and wait for in-flight ones
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        if self.status() == WorkerStatus::Stopped {
            return Ok(());
        }

        info!("Initiating graceful shutdown");
        *self.status.write() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_tasks = self.in_flight(), "Shutdown timeout reached");
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!("External task worker stopped");
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let handlers = self.handlers.read().clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let mut poller = ExternalTaskPoller::new(
            Arc::clone(&self.engine),
            self.config.worker_id.clone(),
            self.config.topics.clone(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        )
        .with_process_definition_key(self.config.process_definition_key.clone());

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available = active_tasks.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let topic = task.topic.clone().unwrap_or_default();
                            let Some(handler) = handlers.get(&topic).cloned() else {
                                warn!(%topic, "No handler registered");
                                continue;
                            };
                            let Ok(permit) = Arc::clone(&active_tasks).try_acquire_owned() else {
                                debug!("No permits available");
                                break;
                            };

                            let engine = Arc::clone(&engine);
                            tokio::spawn(async move {
                                let task_id = task.id;
                                report(&engine, task_id, handler(task).await).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "Poll error"),
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }
}

/// Hand a task result back to the engine
async fn report(engine: &Engine, task_id: Uuid, result: TaskResult) {
    let reported = match result {
        Ok(output) => engine.complete_activity(task_id, output).await,
        Err(e) => {
            let failure = Failure::retryable(format!("{e:#}"));
            engine.fail_activity(task_id, failure, Map::new()).await
        }
    };
    if let Err(e) = reported {
        error!(%task_id, error = %e, "Failed to report task result");
    }
}
