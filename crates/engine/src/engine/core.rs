//! Shared engine state and command routing

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::trace;
use uuid::Uuid;

use super::{EngineError, TimerService};
use crate::behavior::BehaviorResolver;
use crate::config::EngineConfig;
use crate::definition::ProcessDefinition;
use crate::dispatch::{
    Command, CommandHandler, CommandOutcome, CommandResult, Dispatcher, EngineEvent, EventBus,
};
use crate::expression::ExpressionEvaluator;
use crate::persistence::{ActivityStore, DefinitionStore, IdGenerator, ProcessStore, VariableStore};
use crate::runtime::{variable, ActivityExecution, Process};

/// Everything a lifecycle service needs
///
/// Lifecycle services live in sibling modules as `impl EngineCore` blocks.
pub struct EngineCore {
    pub(crate) definitions: Arc<dyn DefinitionStore>,
    pub(crate) activities: Arc<dyn ActivityStore>,
    pub(crate) processes: Arc<dyn ProcessStore>,
    pub(crate) variables: Arc<dyn VariableStore>,
    pub(crate) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) behaviors: BehaviorResolver,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) timers: TimerService,
    pub(crate) config: EngineConfig,
    me: Weak<EngineCore>,
}

/// A persisted execution with its process and definition
pub(crate) struct ExecutionContext {
    pub process: Process,
    pub definition: Arc<ProcessDefinition>,
    pub execution: ActivityExecution,
}

pub(crate) struct CoreParts {
    pub definitions: Arc<dyn DefinitionStore>,
    pub activities: Arc<dyn ActivityStore>,
    pub processes: Arc<dyn ProcessStore>,
    pub variables: Arc<dyn VariableStore>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub ids: Arc<dyn IdGenerator>,
    pub behaviors: BehaviorResolver,
    pub dispatcher: Dispatcher,
    pub bus: Arc<EventBus>,
    pub timers: TimerService,
    pub config: EngineConfig,
}

impl EngineCore {
    pub(crate) fn new(parts: CoreParts) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            definitions: parts.definitions,
            activities: parts.activities,
            processes: parts.processes,
            variables: parts.variables,
            evaluator: parts.evaluator,
            ids: parts.ids,
            behaviors: parts.behaviors,
            dispatcher: parts.dispatcher,
            bus: parts.bus,
            timers: parts.timers,
            config: parts.config,
            me: me.clone(),
        })
    }

    /// This core as a handler for fan-out batches
    pub(crate) fn handler(&self) -> Result<Arc<dyn CommandHandler>, EngineError> {
        match self.me.upgrade() {
            Some(core) => Ok(core),
            None => Err(EngineError::Shutdown),
        }
    }

    pub(crate) async fn publish(&self, event: EngineEvent) {
        self.bus.publish(event).await;
    }

    pub(crate) async fn process_context(
        &self,
        process_id: Uuid,
    ) -> Result<(Process, Arc<ProcessDefinition>), EngineError> {
        let process = self.processes.find_process(process_id).await?;
        let definition = self.definitions.find_definition(process.definition_id).await?;
        Ok((process, definition))
    }

    pub(crate) async fn load(&self, execution_id: Uuid) -> Result<ExecutionContext, EngineError> {
        let execution = self.activities.find_activity(execution_id).await?;
        let (process, definition) = self.process_context(execution.process_id).await?;
        Ok(ExecutionContext {
            process,
            definition,
            execution,
        })
    }

    /// Variables visible through a scope chain, nearest scope wins
    pub(crate) async fn visible_variables(
        &self,
        process_id: Uuid,
        scope: &[String],
    ) -> Result<Map<String, Value>, EngineError> {
        let found = self.variables.find_in_scope(process_id, scope).await?;
        Ok(variable::to_map(&found, scope))
    }

    /// Fresh SCHEDULED executions for `targets`, not yet persisted
    pub(crate) fn new_executions(
        &self,
        process: &Process,
        definition: &ProcessDefinition,
        targets: &[String],
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        targets
            .iter()
            .map(|target| {
                let activity = definition.require(target)?;
                Ok(ActivityExecution::new(self.ids.next_id(), process, activity))
            })
            .collect()
    }

    /// Executions that are not settled yet, FAILED included
    pub(crate) async fn open_executions(
        &self,
        process_id: Uuid,
        definition_ids: Option<&[String]>,
    ) -> Result<Vec<ActivityExecution>, EngineError> {
        let executions = self.activities.find_by_process(process_id).await?;
        Ok(executions
            .into_iter()
            .filter(|e| !e.is_in_terminal_state())
            .filter(|e| definition_ids.map_or(true, |ids| ids.contains(&e.definition_id)))
            .collect())
    }

    /// Write variables at process scope and announce the change
    pub(crate) async fn save_process_variables(
        &self,
        process: &Process,
        values: Map<String, Value>,
    ) -> Result<(), EngineError> {
        if values.is_empty() {
            return Ok(());
        }
        let scope = process.definition_key.clone();
        let records = variable::from_map(&values, process.id, process.id, &scope);
        self.variables.save_variables(records).await?;

        self.publish(EngineEvent::VariablesSet {
            process_id: process.id,
            scopes: vec![scope],
        })
        .await;
        Ok(())
    }

    /// Write variables local to an execution
    pub(crate) async fn save_local_variables(
        &self,
        execution: &ActivityExecution,
        values: &Map<String, Value>,
    ) -> Result<(), EngineError> {
        if values.is_empty() {
            return Ok(());
        }
        let records = variable::from_map(
            values,
            execution.process_id,
            execution.id,
            &execution.definition_id,
        );
        self.variables.save_variables(records).await?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for EngineCore {
    async fn handle(&self, command: Command) -> CommandResult {
        trace!(command = command.name(), "Handling command");
        match command {
            Command::StartProcess(request) => {
                self.start_process(request).await.map(CommandOutcome::Process)
            }
            Command::RunActivity {
                process_id,
                definition_id,
            } => {
                let (process, definition) = self.process_context(process_id).await?;
                self.run_new(&process, &definition, &definition_id).await
            }
            Command::ExecuteActivity { activity_id } | Command::RetryActivity { activity_id } => {
                self.run_execution(activity_id).await
            }
            Command::CompleteActivity {
                activity_id,
                variables,
            } => self.complete_execution(activity_id, variables).await,
            Command::FailActivity {
                activity_id,
                failure,
                variables,
            } => self.fail_execution(activity_id, failure, variables).await,
            Command::CancelActivity { activity_id } => self.cancel_execution(activity_id).await,
            Command::TerminateActivity {
                activity_id,
                propagate,
            } => self.terminate_execution(activity_id, propagate).await,
            Command::TriggerActivity {
                process_id,
                definition_id,
                variables,
            } => self.trigger(process_id, &definition_id, variables).await,
            Command::CompleteScope {
                process_id,
                definition_id,
            } => self.complete_scope(process_id, &definition_id).await,
            Command::CompleteProcess { process_id } => self.complete_process(process_id).await,
            Command::CancelProcess { process_id } => self.cancel_process(process_id).await,
            Command::TerminateProcess { process_id } => self.terminate_process(process_id).await,
            Command::IncidentProcess { process_id, reason } => {
                self.incident_process(process_id, reason).await
            }
            Command::RecoverProcess { process_id } => self.recover_process(process_id).await,
            Command::CorrelateError {
                activity_id,
                error_code,
            } => self.correlate_error(activity_id, error_code).await,
            Command::CorrelateEscalation {
                activity_id,
                escalation_code,
            } => self.correlate_escalation(activity_id, escalation_code).await,
            Command::CorrelateVariables { process_id, scopes } => {
                self.correlate_variables(process_id, &scopes).await
            }
        }
    }
}
