//! Sub-process, event sub-process and call activity behaviors

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Cancellable, Completable, Failable, Invocation, RunOutcome, Runnable};
use crate::definition::{CallMapping, ModelError};
use crate::dispatch::{Command, StartRequest};
use crate::engine::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::persistence::optional_transition;
use crate::runtime::{ActivityExecution, ParentLink};

/// Apply call activity mappings to the variables of the other process
pub(crate) fn map_call(
    evaluator: &dyn ExpressionEvaluator,
    mappings: &[CallMapping],
    source: &Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut mapped = Map::new();
    for mapping in mappings {
        match mapping {
            CallMapping::All => mapped.extend(source.clone()),
            CallMapping::Copy { source: key, target } => {
                if let Some(value) = source.get(key) {
                    mapped.insert(target.clone(), value.clone());
                }
            }
            CallMapping::Expression { expression, target } => {
                let value = evaluator.evaluate(expression, source)?;
                mapped.insert(target.clone(), value);
            }
        }
    }
    Ok(mapped)
}

/// Terminate every unsettled execution nested in a container
async fn terminate_descendants(invocation: &Invocation<'_>) -> Result<(), EngineError> {
    let nested: Vec<String> = invocation
        .definition
        .descendants(&invocation.activity.id)
        .into_iter()
        .map(|a| a.id.clone())
        .collect();
    let core = invocation.core;
    for execution in core
        .open_executions(invocation.process.id, Some(&nested))
        .await?
    {
        core.terminate_execution(execution.id, true).await?;
    }
    Ok(())
}

/// Embedded sub-process
///
/// Runs its inner start event and completes once nothing inside it is
/// pending any more.
pub struct SubProcess;

#[async_trait]
impl Runnable for SubProcess {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let start = invocation
            .definition
            .start_activity_in(Some(&invocation.activity.id))?;
        let scheduled = invocation
            .core
            .activities
            .schedule(ActivityExecution::new(
                invocation.core.ids.next_id(),
                invocation.process,
                start,
            ))
            .await?;
        invocation.dispatch(Command::ExecuteActivity {
            activity_id: scheduled.id,
        });
        Ok(RunOutcome::Wait)
    }
}

impl Completable for SubProcess {}
impl Failable for SubProcess {}

#[async_trait]
impl Cancellable for SubProcess {
    async fn terminate(
        &self,
        invocation: &Invocation<'_>,
        propagate: bool,
    ) -> Result<Option<ActivityExecution>, EngineError> {
        let terminated =
            optional_transition(invocation.core.activities.terminate(invocation.execution.id).await)?;
        if propagate {
            terminate_descendants(invocation).await?;
        }
        Ok(terminated)
    }
}

/// Event sub-process: opened by its event start, waits for its content
pub struct EventSubProcess;

#[async_trait]
impl Runnable for EventSubProcess {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Wait)
    }
}

impl Completable for EventSubProcess {}

#[async_trait]
impl Cancellable for EventSubProcess {
    async fn terminate(
        &self,
        invocation: &Invocation<'_>,
        propagate: bool,
    ) -> Result<Option<ActivityExecution>, EngineError> {
        let terminated =
            optional_transition(invocation.core.activities.terminate(invocation.execution.id).await)?;
        if propagate {
            terminate_descendants(invocation).await?;
        }
        Ok(terminated)
    }
}

/// Call activity: starts a called process and waits for it
///
/// The called process completes this activity when it completes, and fails
/// it when it reaches an incident.
pub struct CallActivity;

#[async_trait]
impl Runnable for CallActivity {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        let activity = invocation.activity;
        let spec = activity.call.as_ref().ok_or_else(|| ModelError::InvalidActivity {
            key: invocation.definition.key.clone(),
            activity_id: activity.id.clone(),
            reason: "call activity without called element".to_string(),
        })?;

        let visible = invocation.visible_variables().await?;
        let inputs = map_call(invocation.core.evaluator.as_ref(), &spec.inputs, &visible)?;

        let mut request = StartRequest::by_key(&spec.called_element)
            .with_variables(inputs)
            .with_parent(ParentLink {
                process_id: invocation.process.id,
                activity_id: invocation.execution.id,
                root_id: invocation.process.root(),
            });
        if let Some(version) = spec.version {
            request = request.with_version(version);
        }

        let called = invocation.core.start_process(request).await?;
        debug!(
            activity_id = %invocation.execution.id,
            called_process_id = %called.id,
            called_element = %spec.called_element,
            "Called process started"
        );
        Ok(RunOutcome::Wait)
    }
}

impl Completable for CallActivity {}
impl Failable for CallActivity {}

#[async_trait]
impl Cancellable for CallActivity {
    async fn terminate(
        &self,
        invocation: &Invocation<'_>,
        propagate: bool,
    ) -> Result<Option<ActivityExecution>, EngineError> {
        let core = invocation.core;
        let terminated = optional_transition(core.activities.terminate(invocation.execution.id).await)?;

        if propagate {
            if let Some(called) = core
                .processes
                .find_by_parent_activity(invocation.execution.id)
                .await?
            {
                if !called.state.is_terminal() {
                    core.terminate_process(called.id).await?;
                }
            }
        }
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MiniJinjaEvaluator;
    use serde_json::json;

    fn source() -> Map<String, Value> {
        json!({"order": 7, "amount": 12.5, "customer": "acme"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_map_call_copy_and_expression() {
        let mappings = vec![
            CallMapping::Copy {
                source: "order".into(),
                target: "order_id".into(),
            },
            CallMapping::Copy {
                source: "missing".into(),
                target: "ignored".into(),
            },
            CallMapping::Expression {
                expression: "${amount * 2}".into(),
                target: "doubled".into(),
            },
        ];

        let mapped = map_call(&MiniJinjaEvaluator, &mappings, &source()).unwrap();

        assert_eq!(mapped.get("order_id"), Some(&json!(7)));
        assert_eq!(mapped.get("doubled"), Some(&json!(25.0)));
        assert!(!mapped.contains_key("ignored"));
        assert_eq!(mapped.len(), 2);
    }

    #[test]
    fn test_map_call_all() {
        let mapped = map_call(&MiniJinjaEvaluator, &[CallMapping::All], &source()).unwrap();
        assert_eq!(mapped, source());
    }
}
