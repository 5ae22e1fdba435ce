//! Activity lifecycle services: run, complete, fail, terminate, trigger

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::core::ExecutionContext;
use super::{EngineCore, EngineError};
use crate::behavior::{Behavior, Completion, Continuation, Invocation, RunOutcome, Trigger};
use crate::definition::{ActivityDefinition, ActivityType, ProcessDefinition};
use crate::dispatch::{Command, CommandOutcome, EngineEvent};
use crate::persistence::{optional_transition, FailureOutcome};
use crate::runtime::{ActivityExecution, Failure, Process};

impl EngineCore {
    /// Schedule a new execution of `activity_id` and run it
    pub(crate) async fn run_new(
        &self,
        process: &Process,
        definition: &Arc<ProcessDefinition>,
        activity_id: &str,
    ) -> Result<CommandOutcome, EngineError> {
        let activity = definition.require(activity_id)?;
        let execution = self
            .activities
            .schedule(ActivityExecution::new(self.ids.next_id(), process, activity))
            .await?;
        self.run_execution(execution.id).await
    }

    /// Resolve inputs, move the execution to ACTIVE and run its behavior
    ///
    /// Retries re-enter here with a FAILED execution.
    #[instrument(skip(self))]
    pub(crate) async fn run_execution(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.process.state.is_terminal() {
            debug!(process_state = %ctx.process.state, "Process ended, not running activity");
            return Ok(CommandOutcome::Skipped);
        }
        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;

        let inputs = match self.resolve_inputs(&ctx, activity).await {
            Ok(inputs) => inputs,
            Err(e) => {
                let invocation = ctx.invocation(self, activity, &ctx.execution);
                return self.route_failure(&invocation, behavior, e).await;
            }
        };

        let Some(execution) = optional_transition(self.activities.run(id, inputs).await)? else {
            debug!(state = %ctx.execution.state, "Activity already settled, not running");
            return Ok(CommandOutcome::Skipped);
        };
        debug!(
            definition_id = %activity.id,
            activity_type = %activity.activity_type,
            "Activity running"
        );

        let invocation = ctx.invocation(self, activity, &execution);
        let outcome = match behavior.runnable.run(&invocation).await {
            Ok(outcome) => outcome,
            Err(e) => return self.route_failure(&invocation, behavior, e).await,
        };

        match outcome {
            RunOutcome::Wait => {
                self.arm_timer_boundaries(&invocation);
                Ok(CommandOutcome::Activity(execution.clone()))
            }
            RunOutcome::Complete => {
                self.complete_invocation(&invocation, behavior, Map::new())
                    .await
            }
            RunOutcome::Completed(completion) => {
                let outputs = self.resolve_outputs(&invocation, &Map::new()).await?;
                self.finish(&invocation, completion, outputs).await
            }
        }
    }

    /// Complete an execution on behalf of an external signal
    ///
    /// Completing a settled execution is a no-op.
    #[instrument(skip(self, variables))]
    pub(crate) async fn complete_execution(
        &self,
        id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.execution.is_in_terminal_state() {
            warn!(state = %ctx.execution.state, "Late completion ignored");
            return Ok(CommandOutcome::Skipped);
        }
        if ctx.process.state.is_terminal() {
            warn!(process_state = %ctx.process.state, "Completion for ended process ignored");
            return Ok(CommandOutcome::Skipped);
        }

        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;
        let invocation = ctx.invocation(self, activity, &ctx.execution);
        self.complete_invocation(&invocation, behavior, variables)
            .await
    }

    /// Complete an execution without taking its outgoing flows
    ///
    /// The enclosing scope is checked for completion as if the path ended.
    pub(crate) async fn complete_in_place(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.execution.is_in_terminal_state() || ctx.process.state.is_terminal() {
            warn!(state = %ctx.execution.state, "In-place completion ignored");
            return Ok(CommandOutcome::Skipped);
        }

        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let invocation = ctx.invocation(self, activity, &ctx.execution);
        match crate::behavior::complete_along(&invocation, &[]).await? {
            Some(completion) => self.finish(&invocation, completion, Map::new()).await,
            None => Ok(CommandOutcome::Skipped),
        }
    }

    /// Persist FAILED, then either retry or let the behavior raise the incident
    #[instrument(skip(self, failure, variables))]
    pub(crate) async fn fail_execution(
        &self,
        id: Uuid,
        failure: Failure,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.execution.is_in_terminal_state() {
            warn!(state = %ctx.execution.state, "Late failure ignored");
            return Ok(CommandOutcome::Skipped);
        }
        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;
        let Some(failable) = &behavior.failable else {
            return Err(EngineError::unsupported("fail", activity.activity_type));
        };

        self.save_process_variables(&ctx.process, variables).await?;

        let Some(outcome) = optional_transition(self.activities.fail(id, failure.clone()).await)?
        else {
            debug!("Activity no longer running, failure ignored");
            return Ok(CommandOutcome::Skipped);
        };

        match outcome {
            FailureOutcome::WillRetry(execution) => {
                warn!(
                    definition_id = %activity.id,
                    retries_left = execution.retries,
                    error = %failure,
                    "Activity failed, retrying"
                );
                let invocation = ctx.invocation(self, activity, &execution);
                failable.retry(&invocation).await?;
                Ok(CommandOutcome::Activity(execution))
            }
            FailureOutcome::Failed(execution) => {
                warn!(definition_id = %activity.id, error = %failure, "Activity failed");
                self.publish(EngineEvent::ActivityFailed {
                    execution: execution.clone(),
                })
                .await;
                let invocation = ctx.invocation(self, activity, &execution);
                failable.fail(&invocation, &failure).await?;
                Ok(CommandOutcome::Activity(execution))
            }
        }
    }

    /// Move an unsettled execution to TERMINATED
    #[instrument(skip(self))]
    pub(crate) async fn terminate_execution(
        &self,
        id: Uuid,
        propagate: bool,
    ) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.execution.is_in_terminal_state() {
            return Ok(CommandOutcome::Skipped);
        }
        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;
        let invocation = ctx.invocation(self, activity, &ctx.execution);

        let terminated = match &behavior.cancellable {
            Some(cancellable) => cancellable.terminate(&invocation, propagate).await?,
            None => optional_transition(self.activities.terminate(id).await)?,
        };
        Ok(Self::terminated(terminated))
    }

    #[instrument(skip(self))]
    pub(crate) async fn cancel_execution(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        let ctx = self.load(id).await?;
        if ctx.execution.is_in_terminal_state() {
            return Ok(CommandOutcome::Skipped);
        }
        let activity = ctx.definition.require(&ctx.execution.definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;
        let Some(cancellable) = &behavior.cancellable else {
            return Err(EngineError::unsupported("cancel", activity.activity_type));
        };
        let invocation = ctx.invocation(self, activity, &ctx.execution);
        let terminated = cancellable.cancel(&invocation).await?;
        Ok(Self::terminated(terminated))
    }

    fn terminated(execution: Option<ActivityExecution>) -> CommandOutcome {
        match execution {
            Some(execution) => {
                debug!(activity_id = %execution.id, definition_id = %execution.definition_id, "Activity terminated");
                CommandOutcome::Activity(execution)
            }
            None => CommandOutcome::Skipped,
        }
    }

    /// Activate a definition off the normal flow
    #[instrument(skip(self, variables))]
    pub(crate) async fn trigger(
        &self,
        process_id: Uuid,
        definition_id: &str,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let (process, definition) = self.process_context(process_id).await?;
        if process.state.is_terminal() {
            debug!(process_state = %process.state, "Process ended, not triggering");
            return Ok(CommandOutcome::Skipped);
        }
        let activity = definition.require(definition_id)?;
        let behavior = self.behaviors.resolve(activity.activity_type)?;
        let Some(triggerable) = &behavior.triggerable else {
            return Err(EngineError::unsupported("trigger", activity.activity_type));
        };

        let trigger = Trigger {
            core: self,
            process: &process,
            definition: &definition,
            activity,
        };
        triggerable.trigger(&trigger, variables).await
    }

    /// Complete running executions of a container once nothing nested is open
    #[instrument(skip(self))]
    pub(crate) async fn complete_scope(
        &self,
        process_id: Uuid,
        container_id: &str,
    ) -> Result<CommandOutcome, EngineError> {
        let (process, definition) = self.process_context(process_id).await?;
        if process.state.is_terminal() {
            return Ok(CommandOutcome::Skipped);
        }
        let nested: Vec<String> = definition
            .descendants(container_id)
            .into_iter()
            .map(|a| a.id.clone())
            .collect();

        let mut outcome = CommandOutcome::Skipped;
        let open = self
            .activities
            .find_active(process_id, Some(&[container_id.to_string()]))
            .await?;
        for execution in open.into_iter().filter(|e| e.is_active()) {
            if self
                .activities
                .is_all_completed(process_id, Some(&nested))
                .await?
            {
                outcome = self.complete_execution(execution.id, Map::new()).await?;
            } else {
                debug!(container = container_id, "Scope still has open activities");
            }
        }
        Ok(outcome)
    }

    async fn complete_invocation(
        &self,
        invocation: &Invocation<'_>,
        behavior: &Behavior,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let Some(completable) = &behavior.completable else {
            return Err(EngineError::unsupported(
                "complete",
                invocation.activity.activity_type,
            ));
        };

        let outputs = match self.resolve_outputs(invocation, &variables).await {
            Ok(outputs) => outputs,
            Err(e) => return self.route_failure(invocation, behavior, e).await,
        };

        match completable.complete(invocation, &variables).await {
            Ok(Some(completion)) => {
                // Derived outputs win over explicit variables
                let mut merged = variables;
                merged.extend(outputs);
                self.finish(invocation, completion, merged).await
            }
            Ok(None) => {
                debug!(definition_id = %invocation.activity.id, "Completion lost to another transition");
                Ok(CommandOutcome::Skipped)
            }
            Err(e) => self.route_failure(invocation, behavior, e).await,
        }
    }

    /// Record variables and events of a persisted completion, then continue
    async fn finish(
        &self,
        invocation: &Invocation<'_>,
        completion: Completion,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let Completion {
            execution,
            continuation,
        } = completion;
        let process_id = invocation.process.id;
        debug!(
            activity_id = %execution.id,
            definition_id = %execution.definition_id,
            "Activity completed"
        );

        self.save_process_variables(invocation.process, variables)
            .await?;
        self.publish(EngineEvent::ActivityCompleted {
            execution: execution.clone(),
        })
        .await;

        match continuation {
            Continuation::Advance(successors) => {
                for activity_id in successors {
                    self.dispatcher
                        .dispatch(Command::ExecuteActivity { activity_id });
                }
            }
            Continuation::EndOfPath => {
                let command = match &invocation.activity.parent_id {
                    Some(container) => Command::CompleteScope {
                        process_id,
                        definition_id: container.clone(),
                    },
                    None => Command::CompleteProcess { process_id },
                };
                self.dispatcher.dispatch(command);
            }
            Continuation::Halt => {}
        }
        Ok(CommandOutcome::Activity(execution))
    }

    /// Send execution failures to FAILED, let every other error abort the command
    async fn route_failure(
        &self,
        invocation: &Invocation<'_>,
        behavior: &Behavior,
        error: EngineError,
    ) -> Result<CommandOutcome, EngineError> {
        if !error.routes_to_fail() || behavior.failable.is_none() {
            return Err(error);
        }
        warn!(
            activity_id = %invocation.execution.id,
            definition_id = %invocation.activity.id,
            error = %error,
            "Activity work failed"
        );
        self.fail_execution(invocation.execution.id, error.to_failure(), Map::new())
            .await
    }

    /// Evaluate input mappings and store them as activity-local variables
    async fn resolve_inputs(
        &self,
        ctx: &ExecutionContext,
        activity: &ActivityDefinition,
    ) -> Result<Map<String, Value>, EngineError> {
        if activity.inputs.is_empty() {
            return Ok(Map::new());
        }
        let scope = ctx.definition.scope(&activity.id)?;
        let visible = self.visible_variables(ctx.process.id, &scope).await?;

        let mut inputs = Map::new();
        for mapping in &activity.inputs {
            let value = self.evaluator.resolve(&mapping.source, &visible)?;
            inputs.insert(mapping.target.clone(), value);
        }
        self.save_local_variables(&ctx.execution, &inputs).await?;
        Ok(inputs)
    }

    /// Evaluate output mappings against the visible and explicit variables
    async fn resolve_outputs(
        &self,
        invocation: &Invocation<'_>,
        variables: &Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut outputs = Map::new();
        if invocation.activity.outputs.is_empty() {
            return Ok(outputs);
        }
        let mut visible = invocation.visible_variables().await?;
        visible.extend(variables.clone());

        for mapping in &invocation.activity.outputs {
            let value = self.evaluator.resolve(&mapping.source, &visible)?;
            outputs.insert(mapping.target.clone(), value);
        }
        Ok(outputs)
    }

    /// Arm the timer boundaries of an activity that started waiting
    fn arm_timer_boundaries(&self, invocation: &Invocation<'_>) {
        for boundary in invocation.definition.boundaries_of(&invocation.activity.id) {
            if boundary.activity_type != ActivityType::TimerBoundaryEvent {
                continue;
            }
            if let Some(delay) = boundary.timer {
                self.timers.schedule(
                    delay,
                    Command::TriggerActivity {
                        process_id: invocation.process.id,
                        definition_id: boundary.id.clone(),
                        variables: Map::new(),
                    },
                );
            }
        }
    }
}

impl ExecutionContext {
    pub(crate) fn invocation<'a>(
        &'a self,
        core: &'a EngineCore,
        activity: &'a ActivityDefinition,
        execution: &'a ActivityExecution,
    ) -> Invocation<'a> {
        Invocation {
            core,
            process: &self.process,
            definition: &self.definition,
            activity,
            execution,
        }
    }
}
