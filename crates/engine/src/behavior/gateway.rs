//! Gateway behaviors

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Cancellable, Completable, Completion, Failable, Invocation, RunOutcome, Runnable};
use crate::definition::{ActivityDefinition, ConditionalFlow, ModelError};
use crate::dispatch::Command;
use crate::engine::EngineError;
use crate::persistence::JoinOutcome;
use crate::runtime::ActivityExecution;

/// Outgoing flows in declared order
///
/// Flows without a declared condition are default flows, the same as an
/// empty condition.
fn outgoing_flows(activity: &ActivityDefinition) -> Vec<ConditionalFlow> {
    let mut flows = activity.conditions.clone();
    for target in &activity.outgoing {
        if !flows.iter().any(|f| &f.target == target) {
            flows.push(ConditionalFlow::new("", target.clone()));
        }
    }
    flows
}

/// Variables the gateway conditions see
async fn condition_variables(
    invocation: &Invocation<'_>,
    variables: &Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut visible = invocation.visible_variables().await?;
    visible.extend(variables.clone());
    Ok(visible)
}

/// Takes the first matching path, or the single default path
pub struct ExclusiveGateway;

#[async_trait]
impl Runnable for ExclusiveGateway {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

#[async_trait]
impl Completable for ExclusiveGateway {
    async fn next(
        &self,
        invocation: &Invocation<'_>,
        variables: &Map<String, Value>,
    ) -> Result<Vec<String>, EngineError> {
        let visible = condition_variables(invocation, variables).await?;
        let evaluator = &invocation.core.evaluator;

        let mut defaults = vec![];
        for flow in outgoing_flows(invocation.activity) {
            if flow.is_default() {
                defaults.push(flow.target);
            } else if evaluator.evaluate_boolean(&flow.condition, &visible)? {
                debug!(gateway = %invocation.activity.id, target = %flow.target, "Exclusive path taken");
                return Ok(vec![flow.target]);
            }
        }

        let gateway = invocation.activity.id.clone();
        match defaults.len() {
            1 => Ok(defaults),
            0 => Err(ModelError::NoExclusivePath { gateway }.into()),
            count => Err(ModelError::MultipleExclusivePaths { gateway, count }.into()),
        }
    }
}

impl Cancellable for ExclusiveGateway {}
impl Failable for ExclusiveGateway {}

/// Takes every matching path, or the default paths when none matches
pub struct InclusiveGateway;

#[async_trait]
impl Runnable for InclusiveGateway {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

#[async_trait]
impl Completable for InclusiveGateway {
    async fn next(
        &self,
        invocation: &Invocation<'_>,
        variables: &Map<String, Value>,
    ) -> Result<Vec<String>, EngineError> {
        let visible = condition_variables(invocation, variables).await?;
        let evaluator = &invocation.core.evaluator;

        let mut matched = vec![];
        let mut defaults = vec![];
        for flow in outgoing_flows(invocation.activity) {
            if flow.is_default() {
                defaults.push(flow.target);
            } else if evaluator.evaluate_boolean(&flow.condition, &visible)? {
                matched.push(flow.target);
            }
        }

        let paths = if matched.is_empty() { defaults } else { matched };
        if paths.is_empty() {
            return Err(ModelError::EmptyInclusiveResult {
                gateway: invocation.activity.id.clone(),
            }
            .into());
        }
        Ok(paths)
    }
}

impl Cancellable for InclusiveGateway {}
impl Failable for InclusiveGateway {}

/// Joins every incoming branch, then forks to every outgoing one
///
/// Each arrival re-evaluates the join predicate atomically in the store,
/// so concurrent arrivals fire the join exactly once.
pub struct ParallelGateway;

#[async_trait]
impl Runnable for ParallelGateway {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let activity = invocation.activity;
        if activity.incoming.len() <= 1 {
            return Ok(RunOutcome::Complete);
        }

        let successors = invocation.successors(&activity.outgoing)?;
        let ids = successors.iter().map(|s| s.id).collect();

        let outcome = invocation
            .core
            .activities
            .complete_join(invocation.execution.id, &activity.incoming, successors)
            .await?;

        match outcome {
            JoinOutcome::Completed(execution) => {
                debug!(gateway = %activity.id, process_id = %invocation.process.id, "Join fired");
                Ok(RunOutcome::Completed(Completion::along(execution, ids)))
            }
            JoinOutcome::Waiting | JoinOutcome::AlreadyJoined => Ok(RunOutcome::Wait),
        }
    }
}

impl Completable for ParallelGateway {}
impl Cancellable for ParallelGateway {}
impl Failable for ParallelGateway {}

/// Races its outgoing catch events
///
/// The first catch event to complete completes the gateway and terminates
/// the others (see the catch event behaviors).
pub struct EventBasedGateway;

#[async_trait]
impl Runnable for EventBasedGateway {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        for target in invocation.successors(&invocation.activity.outgoing)? {
            let scheduled: ActivityExecution = invocation.core.activities.schedule(target).await?;
            invocation.dispatch(Command::ExecuteActivity {
                activity_id: scheduled.id,
            });
        }
        Ok(RunOutcome::Wait)
    }
}

impl Cancellable for EventBasedGateway {}
impl Failable for EventBasedGateway {}
