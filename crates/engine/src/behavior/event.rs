//! Event behaviors

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    complete_along, Cancellable, Completable, Completion, Failable, Invocation, RunOutcome,
    Runnable, Trigger, Triggerable,
};
use crate::definition::{ActivityDefinition, ActivityType, ModelError};
use crate::dispatch::{Command, CommandOutcome};
use crate::engine::EngineError;
use crate::persistence::optional_transition;

fn invalid(definition_key: &str, activity: &ActivityDefinition, reason: &str) -> EngineError {
    ModelError::InvalidActivity {
        key: definition_key.to_string(),
        activity_id: activity.id.clone(),
        reason: reason.to_string(),
    }
    .into()
}

/// None start, none end and none throw events
pub struct PassThroughEvent;

#[async_trait]
impl Runnable for PassThroughEvent {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

impl Completable for PassThroughEvent {}
impl Cancellable for PassThroughEvent {}

/// Start event of an event sub-process
///
/// Triggering it opens a new execution of the event sub-process. An
/// interrupting start first terminates everything else running in the
/// enclosing scope.
pub struct EventStart;

#[async_trait]
impl Runnable for EventStart {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

impl Completable for EventStart {}
impl Cancellable for EventStart {}

#[async_trait]
impl Triggerable for EventStart {
    async fn trigger(
        &self,
        trigger: &Trigger<'_>,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let core = trigger.core;
        let process_id = trigger.process.id;
        let activity = trigger.activity;

        let esp = match activity.parent_id.as_deref() {
            Some(parent) => trigger.definition.require(parent)?,
            None => {
                return Err(invalid(
                    &trigger.definition.key,
                    activity,
                    "event start outside an event sub-process",
                ))
            }
        };
        let enclosing = esp.parent_id.as_deref();

        let scope_running = match enclosing {
            None => trigger.process.is_active(),
            Some(container) => core
                .activities
                .find_active(process_id, Some(&[container.to_string()]))
                .await?
                .iter()
                .any(|e| e.is_active()),
        };
        if !scope_running {
            debug!(definition_id = %activity.id, "Enclosing scope not running, skipping event start");
            return Ok(CommandOutcome::Skipped);
        }

        if activity.activity_type == ActivityType::ConditionalStartEvent {
            let open = core
                .activities
                .find_active(process_id, Some(&[esp.id.clone()]))
                .await?;
            if !open.is_empty() {
                debug!(definition_id = %activity.id, "Event sub-process already running");
                return Ok(CommandOutcome::Skipped);
            }
        }

        if activity.is_interrupting() {
            let others: Vec<String> = trigger
                .definition
                .children(enclosing)
                .into_iter()
                .filter(|a| a.id != esp.id)
                .map(|a| a.id.clone())
                .collect();
            for execution in core.open_executions(process_id, Some(&others)).await? {
                core.terminate_execution(execution.id, true).await?;
            }
        }

        core.save_process_variables(trigger.process, variables).await?;
        core.run_new(trigger.process, trigger.definition, &esp.id)
            .await?;
        core.run_new(trigger.process, trigger.definition, &activity.id)
            .await
    }
}

/// Terminate end event
///
/// At the root it terminates the process. Inside a sub-process it
/// terminates everything else in the sub-process, which then completes.
pub struct TerminateEnd;

#[async_trait]
impl Runnable for TerminateEnd {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let core = invocation.core;
        let process_id = invocation.process.id;

        match invocation.activity.parent_id.as_deref() {
            None => {
                let completed = optional_transition(
                    core.activities
                        .complete(invocation.execution.id, vec![])
                        .await,
                )?;
                match completed {
                    Some(execution) => {
                        core.terminate_process(process_id).await?;
                        // A called process ended this way still returns to its caller
                        core.signal_parent(invocation.process).await?;
                        Ok(RunOutcome::Completed(Completion::halt(execution)))
                    }
                    None => Ok(RunOutcome::Wait),
                }
            }
            Some(container) => {
                let others: Vec<String> = invocation
                    .definition
                    .descendants(container)
                    .into_iter()
                    .filter(|a| a.id != invocation.activity.id)
                    .map(|a| a.id.clone())
                    .collect();
                for execution in core.open_executions(process_id, Some(&others)).await? {
                    core.terminate_execution(execution.id, true).await?;
                }
                Ok(RunOutcome::Complete)
            }
        }
    }
}

impl Completable for TerminateEnd {}
impl Cancellable for TerminateEnd {}

/// Error end event: waits while its error is correlated
pub struct ErrorEnd;

#[async_trait]
impl Runnable for ErrorEnd {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        invocation.dispatch(Command::CorrelateError {
            activity_id: invocation.execution.id,
            error_code: invocation.activity.error_code.clone(),
        });
        Ok(RunOutcome::Wait)
    }
}

impl Completable for ErrorEnd {}
impl Cancellable for ErrorEnd {}
impl Failable for ErrorEnd {}

/// Escalation end and intermediate throw events
///
/// They wait while the escalation is correlated and are completed by the
/// correlation unless an interrupting handler terminates them.
pub struct EscalationThrow;

#[async_trait]
impl Runnable for EscalationThrow {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        invocation.dispatch(Command::CorrelateEscalation {
            activity_id: invocation.execution.id,
            escalation_code: invocation.activity.escalation_code.clone(),
        });
        Ok(RunOutcome::Wait)
    }
}

impl Completable for EscalationThrow {}
impl Cancellable for EscalationThrow {}

/// Completion shared by catch events
///
/// A catch event behind an event-based gateway first has to win the race:
/// it completes the gateway, then terminates its sibling catch events. The
/// loser terminates itself.
async fn complete_catch(invocation: &Invocation<'_>) -> Result<Option<Completion>, EngineError> {
    let core = invocation.core;
    let process_id = invocation.process.id;
    let gateway = invocation
        .definition
        .previous_activities(&invocation.activity.id)?
        .into_iter()
        .find(|a| a.activity_type == ActivityType::EventBasedGateway);

    if let Some(gateway) = gateway {
        let open = core
            .activities
            .find_active(process_id, Some(&[gateway.id.clone()]))
            .await?;
        let won = match open.into_iter().find(|e| e.is_active()) {
            Some(race) => optional_transition(core.activities.complete(race.id, vec![]).await)?
                .is_some(),
            None => false,
        };

        if !won {
            debug!(definition_id = %invocation.activity.id, "Lost event-based race");
            optional_transition(core.activities.terminate(invocation.execution.id).await)?;
            return Ok(None);
        }

        let siblings: Vec<String> = gateway
            .outgoing
            .iter()
            .filter(|id| **id != invocation.activity.id)
            .cloned()
            .collect();
        for sibling in core.activities.find_active(process_id, Some(&siblings)).await? {
            optional_transition(core.activities.terminate(sibling.id).await)?;
        }
    }

    complete_along(invocation, &invocation.activity.outgoing).await
}

/// Complete the waiting execution of a catch event
async fn complete_waiting(
    trigger: &Trigger<'_>,
    variables: Map<String, Value>,
) -> Result<CommandOutcome, EngineError> {
    let waiting = trigger
        .core
        .activities
        .find_active(trigger.process.id, Some(&[trigger.activity.id.clone()]))
        .await?
        .into_iter()
        .find(|e| e.is_active());

    match waiting {
        Some(execution) => {
            trigger
                .core
                .complete_execution(execution.id, variables)
                .await
        }
        None => {
            warn!(
                process_id = %trigger.process.id,
                definition_id = %trigger.activity.id,
                "No waiting catch event to trigger"
            );
            Ok(CommandOutcome::Skipped)
        }
    }
}

/// Intermediate message catch event
pub struct MessageCatch;

#[async_trait]
impl Runnable for MessageCatch {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Wait)
    }
}

#[async_trait]
impl Completable for MessageCatch {
    async fn complete(
        &self,
        invocation: &Invocation<'_>,
        _variables: &Map<String, Value>,
    ) -> Result<Option<Completion>, EngineError> {
        complete_catch(invocation).await
    }
}

impl Cancellable for MessageCatch {}

#[async_trait]
impl Triggerable for MessageCatch {
    async fn trigger(
        &self,
        trigger: &Trigger<'_>,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        complete_waiting(trigger, variables).await
    }
}

/// Intermediate timer catch event: completes once its duration elapsed
pub struct TimerCatch;

#[async_trait]
impl Runnable for TimerCatch {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let duration = invocation.activity.timer.ok_or_else(|| {
            invalid(
                &invocation.definition.key,
                invocation.activity,
                "timer without duration",
            )
        })?;
        invocation.core.timers.schedule(
            duration,
            Command::CompleteActivity {
                activity_id: invocation.execution.id,
                variables: Map::new(),
            },
        );
        Ok(RunOutcome::Wait)
    }
}

#[async_trait]
impl Completable for TimerCatch {
    async fn complete(
        &self,
        invocation: &Invocation<'_>,
        _variables: &Map<String, Value>,
    ) -> Result<Option<Completion>, EngineError> {
        complete_catch(invocation).await
    }
}

impl Cancellable for TimerCatch {}

/// Intermediate conditional catch event
///
/// Completes right away when its condition already holds, otherwise waits
/// for a variable change that makes it true.
pub struct ConditionalCatch;

#[async_trait]
impl Runnable for ConditionalCatch {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let condition = invocation.activity.condition.as_deref().ok_or_else(|| {
            invalid(
                &invocation.definition.key,
                invocation.activity,
                "conditional event without condition",
            )
        })?;
        let visible = invocation.visible_variables().await?;
        if invocation
            .core
            .evaluator
            .evaluate_boolean(condition, &visible)?
        {
            Ok(RunOutcome::Complete)
        } else {
            Ok(RunOutcome::Wait)
        }
    }
}

#[async_trait]
impl Completable for ConditionalCatch {
    async fn complete(
        &self,
        invocation: &Invocation<'_>,
        _variables: &Map<String, Value>,
    ) -> Result<Option<Completion>, EngineError> {
        complete_catch(invocation).await
    }
}

impl Cancellable for ConditionalCatch {}

#[async_trait]
impl Triggerable for ConditionalCatch {
    async fn trigger(
        &self,
        trigger: &Trigger<'_>,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        complete_waiting(trigger, variables).await
    }
}

/// Boundary events of every kind
///
/// A trigger only fires while the host activity runs. An interrupting
/// boundary terminates the host, including everything nested in it.
pub struct BoundaryEvent;

#[async_trait]
impl Runnable for BoundaryEvent {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

impl Completable for BoundaryEvent {}
impl Cancellable for BoundaryEvent {}

#[async_trait]
impl Triggerable for BoundaryEvent {
    async fn trigger(
        &self,
        trigger: &Trigger<'_>,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError> {
        let core = trigger.core;
        let activity = trigger.activity;
        let host_id = activity.attached_to.as_deref().ok_or_else(|| {
            invalid(&trigger.definition.key, activity, "boundary event without host")
        })?;

        let host = core
            .activities
            .find_active(trigger.process.id, Some(&[host_id.to_string()]))
            .await?
            .into_iter()
            .find(|e| e.is_active());
        let Some(host) = host else {
            debug!(definition_id = %activity.id, host = host_id, "Host not running, skipping boundary");
            return Ok(CommandOutcome::Skipped);
        };

        if activity.is_interrupting() {
            let outcome = core.terminate_execution(host.id, true).await?;
            if outcome.is_skipped() {
                return Ok(CommandOutcome::Skipped);
            }
        }

        core.save_process_variables(trigger.process, variables).await?;
        core.run_new(trigger.process, trigger.definition, &activity.id)
            .await
    }
}
