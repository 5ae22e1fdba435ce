//! Public engine facade

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

use super::core::CoreParts;
use super::listener::{ConditionalListener, MetricsListener, RecoveryListener};
use super::{
    EngineCore, EngineError, MessageCorrelation, MigrationError, MigrationPlan, MigrationReport,
    TimerService,
};
use crate::behavior::BehaviorResolver;
use crate::config::EngineConfig;
use crate::definition::ProcessDefinition;
use crate::dispatch::{
    Command, CommandOutcome, Dispatcher, EngineEvent, EventBus, EventListener, StartRequest,
};
use crate::expression::{ExpressionEvaluator, MiniJinjaEvaluator};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::persistence::{
    ActivityStore, DefinitionStore, IdGenerator, InMemoryStore, PollRequest, ProcessStore,
    UuidV7Ids, VariableStore,
};
use crate::runtime::{ActivityExecution, Failure, Process, Variable};
use crate::worker::TimeoutSweeper;

/// Wiring for an [`Engine`]
pub struct EngineBuilder {
    definitions: Arc<dyn DefinitionStore>,
    activities: Arc<dyn ActivityStore>,
    processes: Arc<dyn ProcessStore>,
    variables: Arc<dyn VariableStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    ids: Arc<dyn IdGenerator>,
    metrics: Arc<dyn MetricsSink>,
    listeners: Vec<Arc<dyn EventListener>>,
    config: EngineConfig,
    timeout_sweeper: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            definitions: store.clone(),
            activities: store.clone(),
            processes: store.clone(),
            variables: store,
            evaluator: Arc::new(MiniJinjaEvaluator),
            ids: Arc::new(UuidV7Ids),
            metrics: Arc::new(NoopMetrics),
            listeners: vec![],
            config: EngineConfig::default(),
            timeout_sweeper: true,
        }
    }
}

impl EngineBuilder {
    /// Use one store for definitions, activities, processes and variables
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DefinitionStore + ActivityStore + ProcessStore + VariableStore,
    {
        self.definitions = store.clone();
        self.activities = store.clone();
        self.processes = store.clone();
        self.variables = store;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe an extra listener to engine events
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Whether expired external task locks are swept (on by default)
    pub fn with_timeout_sweeper(mut self, enabled: bool) -> Self {
        self.timeout_sweeper = enabled;
        self
    }

    /// Wire the engine and start its background loops
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        let behaviors = BehaviorResolver::standard()?;
        let (dispatcher, queue) = Dispatcher::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bus = Arc::new(EventBus::new());
        bus.subscribe(Arc::new(RecoveryListener::new(
            Arc::clone(&self.processes),
            dispatcher.clone(),
        )));
        bus.subscribe(Arc::new(ConditionalListener::new(dispatcher.clone())));
        bus.subscribe(Arc::new(MetricsListener::new(self.metrics)));
        for listener in self.listeners {
            bus.subscribe(listener);
        }

        let core = EngineCore::new(CoreParts {
            definitions: self.definitions,
            activities: Arc::clone(&self.activities),
            processes: self.processes,
            variables: self.variables,
            evaluator: self.evaluator,
            ids: self.ids,
            behaviors,
            dispatcher: dispatcher.clone(),
            bus,
            timers: TimerService::new(dispatcher.clone(), shutdown_rx.clone()),
            config: self.config.clone(),
        });

        let mut tasks = vec![queue.spawn(core.clone(), self.config.max_workers, shutdown_rx.clone())];
        if self.timeout_sweeper {
            let sweeper = TimeoutSweeper::new(
                self.activities,
                dispatcher.clone(),
                self.config.sweep_interval,
                self.config.sweep_batch_size,
                shutdown_rx,
            );
            tasks.push(sweeper.spawn());
        }

        info!(max_workers = self.config.max_workers, "Engine started");
        Ok(Engine {
            core,
            dispatcher,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

/// The process engine
///
/// Commands issued here run on the engine's worker pool; the call returns
/// once the command itself is done; follow-up work continues in the
/// background until [`Engine::wait_idle`] observes an empty queue.
pub struct Engine {
    core: Arc<EngineCore>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Validate and store a definition under the next version of its key
    pub async fn deploy(
        &self,
        definition: ProcessDefinition,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        let mut deployed = self.deploy_all(vec![definition]).await?;
        deployed
            .pop()
            .ok_or_else(|| EngineError::Internal("store returned no definition".into()))
    }

    pub async fn deploy_all(
        &self,
        definitions: Vec<ProcessDefinition>,
    ) -> Result<Vec<Arc<ProcessDefinition>>, EngineError> {
        let mut prepared = Vec::with_capacity(definitions.len());
        for mut definition in definitions {
            definition.validate()?;
            definition.id = self.core.ids.next_id();
            prepared.push(definition);
        }

        let deployed = self.core.definitions.save(prepared).await?;
        for definition in &deployed {
            info!(key = %definition.key, version = definition.version, "Definition deployed");
        }
        Ok(deployed)
    }

    pub async fn definition(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, EngineError> {
        Ok(self.core.definitions.find_definition(id).await?)
    }

    pub async fn latest_definition(&self, key: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        Ok(self.core.definitions.find_latest_by_key(key).await?)
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    pub async fn start_process(&self, request: StartRequest) -> Result<Process, EngineError> {
        self.dispatcher
            .execute(Command::StartProcess(request))
            .await?
            .into_process()
            .ok_or_else(|| EngineError::Internal("start did not return a process".into()))
    }

    pub async fn cancel_process(&self, process_id: Uuid) -> Result<CommandOutcome, EngineError> {
        self.dispatcher
            .execute(Command::CancelProcess { process_id })
            .await
    }

    pub async fn terminate_process(
        &self,
        process_id: Uuid,
    ) -> Result<CommandOutcome, EngineError> {
        self.dispatcher
            .execute(Command::TerminateProcess { process_id })
            .await
    }

    /// Stop accepting external completions and polls for a process
    #[instrument(skip(self))]
    pub async fn suspend_process(&self, process_id: Uuid) -> Result<Process, EngineError> {
        let process = self.core.processes.set_suspended(process_id, true).await?;
        info!("Process suspended");
        Ok(process)
    }

    #[instrument(skip(self))]
    pub async fn resume_process(&self, process_id: Uuid) -> Result<Process, EngineError> {
        let process = self.core.processes.set_suspended(process_id, false).await?;
        info!("Process resumed");
        Ok(process)
    }

    // ------------------------------------------------------------------
    // Activities
    // ------------------------------------------------------------------

    /// Complete a waiting activity, writing `variables` along with it
    pub async fn complete_activity(
        &self,
        activity_id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        self.ensure_not_suspended(activity_id).await?;
        self.dispatcher
            .execute(Command::CompleteActivity {
                activity_id,
                variables,
            })
            .await
    }

    pub async fn fail_activity(
        &self,
        activity_id: Uuid,
        failure: Failure,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        self.ensure_not_suspended(activity_id).await?;
        self.dispatcher
            .execute(Command::FailActivity {
                activity_id,
                failure,
                variables,
            })
            .await
    }

    /// Re-run a FAILED activity
    pub async fn retry_activity(&self, activity_id: Uuid) -> Result<CommandOutcome, EngineError> {
        self.dispatcher
            .execute(Command::RetryActivity { activity_id })
            .await
    }

    async fn ensure_not_suspended(&self, activity_id: Uuid) -> Result<(), EngineError> {
        let execution = self.core.activities.find_activity(activity_id).await?;
        let process = self.core.processes.find_process(execution.process_id).await?;
        if process.suspended {
            return Err(EngineError::ProcessSuspended(process.id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Correlation and external tasks
    // ------------------------------------------------------------------

    pub async fn correlate_message(
        &self,
        correlation: MessageCorrelation,
    ) -> Result<Process, EngineError> {
        self.core.correlate_message(correlation).await
    }

    /// Claim ACTIVE service tasks of a topic, locked for the configured duration
    pub async fn poll_external_tasks(
        &self,
        request: &PollRequest,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        let lock_duration = chrono::Duration::from_std(self.core.config.lock_duration)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(self
            .core
            .activities
            .poll(request, Utc::now() + lock_duration)
            .await?)
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Write process-scope variables
    pub async fn set_variables(
        &self,
        process_id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<(), EngineError> {
        let process = self.core.processes.find_process(process_id).await?;
        self.core.save_process_variables(&process, variables).await
    }

    /// Write variables local to one activity execution
    pub async fn set_local_variables(
        &self,
        activity_id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<(), EngineError> {
        if variables.is_empty() {
            return Ok(());
        }
        let execution = self.core.activities.find_activity(activity_id).await?;
        self.core.save_local_variables(&execution, &variables).await?;
        self.core
            .publish(EngineEvent::VariablesSet {
                process_id: execution.process_id,
                scopes: vec![execution.definition_id.clone()],
            })
            .await;
        Ok(())
    }

    /// Overwrite one stored variable
    pub async fn update_variable(&self, variable: Variable) -> Result<Variable, EngineError> {
        let process_id = variable.process_id;
        let scope = variable.execution_definition_id.clone();
        let updated = self.core.variables.update_variable(variable).await?;
        self.core
            .publish(EngineEvent::VariablesSet {
                process_id,
                scopes: vec![scope],
            })
            .await;
        Ok(updated)
    }

    /// Process-scope variables
    pub async fn variables(&self, process_id: Uuid) -> Result<Map<String, Value>, EngineError> {
        let process = self.core.processes.find_process(process_id).await?;
        self.core
            .visible_variables(process_id, &[process.definition_key])
            .await
    }

    /// Variables visible from an activity execution, nearest scope winning
    pub async fn scoped_variables(
        &self,
        activity_id: Uuid,
    ) -> Result<Map<String, Value>, EngineError> {
        let context = self.core.load(activity_id).await?;
        let scope = context.execution.scope(&context.definition)?;
        self.core
            .visible_variables(context.process.id, &scope)
            .await
    }

    /// Every stored variable of a process, across scopes
    pub async fn raw_variables(&self, process_id: Uuid) -> Result<Vec<Variable>, EngineError> {
        Ok(self.core.variables.find_in_process(process_id).await?)
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub async fn migrate(&self, plan: &MigrationPlan) -> Result<MigrationReport, MigrationError> {
        self.core.migrate(plan).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn process(&self, process_id: Uuid) -> Result<Process, EngineError> {
        Ok(self.core.processes.find_process(process_id).await?)
    }

    pub async fn processes_by_business_key(
        &self,
        business_key: &str,
    ) -> Result<Vec<Process>, EngineError> {
        Ok(self.core.processes.find_by_business_key(business_key).await?)
    }

    /// Process started by a call activity execution
    pub async fn called_process(&self, activity_id: Uuid) -> Result<Option<Process>, EngineError> {
        Ok(self.core.processes.find_by_parent_activity(activity_id).await?)
    }

    pub async fn activity(&self, activity_id: Uuid) -> Result<ActivityExecution, EngineError> {
        Ok(self.core.activities.find_activity(activity_id).await?)
    }

    pub async fn activities(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self.core.activities.find_by_process(process_id).await?)
    }

    /// Executions of one activity definition in a process
    pub async fn activities_of(
        &self,
        process_id: Uuid,
        definition_id: &str,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self
            .core
            .activities
            .find_by_definition_id(process_id, definition_id)
            .await?)
    }

    pub async fn active_activities(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self.core.activities.find_active(process_id, None).await?)
    }

    pub async fn failed_activities(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self.core.activities.find_failed(process_id).await?)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Wait until no command is queued or running
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// Stop the worker pool and background loops
    ///
    /// Queued commands are rejected; pending timers are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Engine stopped");
    }
}

