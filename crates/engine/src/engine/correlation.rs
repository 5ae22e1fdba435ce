//! Correlation services: errors, escalations, messages and conditions

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{CorrelationError, EngineCore, EngineError};
use crate::definition::{ModelError, ProcessDefinition};
use crate::dispatch::{Command, CommandOutcome};
use crate::runtime::{Failure, Process};

/// A message to deliver to exactly one waiting process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCorrelation {
    pub message: String,
    pub business_key: Option<String>,

    /// Process variables a candidate must hold
    #[serde(default)]
    pub correlation_keys: Map<String, Value>,

    /// Variables written to the correlated process
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl MessageCorrelation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>, value: Value) -> Self {
        self.correlation_keys.insert(key.into(), value);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }
}

/// Nearest handler for an error thrown at `anchor`
///
/// Boundary events on the anchor and its enclosing activities come first,
/// then error start events of event sub-processes along the scope chain.
fn find_error_handler(
    definition: &ProcessDefinition,
    anchor: &str,
    code: Option<&str>,
) -> Result<Option<String>, ModelError> {
    find_handler(definition, anchor, |candidate| candidate.catches_error(code))
}

fn find_escalation_handler(
    definition: &ProcessDefinition,
    anchor: &str,
    code: Option<&str>,
) -> Result<Option<String>, ModelError> {
    find_handler(definition, anchor, |candidate| {
        candidate.catches_escalation(code)
    })
}

fn find_handler(
    definition: &ProcessDefinition,
    anchor: &str,
    catches: impl Fn(&crate::definition::ActivityDefinition) -> bool,
) -> Result<Option<String>, ModelError> {
    let chain = definition.scope(anchor)?;
    let root = definition.root_scope();

    for id in chain.iter().filter(|id| id.as_str() != root) {
        if let Some(boundary) = definition
            .boundaries_of(id)
            .into_iter()
            .find(|b| catches(b))
        {
            return Ok(Some(boundary.id.clone()));
        }
    }

    for id in &chain {
        let container = (id.as_str() != root).then_some(id.as_str());
        for esp in definition.event_sub_processes(container) {
            // An event sub-process never handles what is thrown inside itself
            if chain.contains(&esp.id) {
                continue;
            }
            if let Some(start) = definition
                .children(Some(&esp.id))
                .into_iter()
                .find(|s| s.activity_type.is_event_start() && catches(s))
            {
                return Ok(Some(start.id.clone()));
            }
        }
    }
    Ok(None)
}

/// Cursor of the walk up the call activity chain
struct Level {
    process: Process,
    definition: Arc<ProcessDefinition>,
    anchor: String,
}

impl EngineCore {
    /// Move from `level` to the process that called it, if any
    async fn caller(&self, level: &Level) -> Result<Option<(Level, Uuid)>, EngineError> {
        let Some(parent_activity_id) = level.process.parent_activity_id else {
            return Ok(None);
        };
        let call = self.activities.find_activity(parent_activity_id).await?;
        let (process, definition) = self.process_context(call.process_id).await?;
        Ok(Some((
            Level {
                process,
                definition,
                anchor: call.definition_id,
            },
            call.id,
        )))
    }

    /// Route a thrown error to its nearest handler
    ///
    /// Walks up through calling processes, terminating each call activity
    /// the error passes. An error nobody handles ends in one incident on
    /// the root process.
    #[instrument(skip(self))]
    pub(crate) async fn correlate_error(
        &self,
        activity_id: Uuid,
        error_code: Option<String>,
    ) -> Result<CommandOutcome, EngineError> {
        let thrower = self.load(activity_id).await?;
        if thrower.execution.is_in_terminal_state() {
            return Ok(CommandOutcome::Skipped);
        }
        let code = error_code.as_deref();

        let mut level = Level {
            process: thrower.process.clone(),
            definition: Arc::clone(&thrower.definition),
            anchor: thrower.execution.definition_id.clone(),
        };
        let mut passed_call: Option<Uuid> = None;

        loop {
            if let Some(handler) = find_error_handler(&level.definition, &level.anchor, code)? {
                info!(
                    process_id = %level.process.id,
                    handler = %handler,
                    error_code = ?code,
                    "Error correlated"
                );
                let Some(call) = passed_call.take() else {
                    return self.trigger(level.process.id, &handler, Map::new()).await;
                };
                return self.handle_at_caller(&level, call, &handler).await;
            }

            if let Some(call) = passed_call.take() {
                self.terminate_execution(call, true).await?;
            }

            match self.caller(&level).await? {
                Some((upper, call)) => {
                    level = upper;
                    passed_call = Some(call);
                }
                None => break,
            }
        }

        let reason = format!("unhandled error {}", code.unwrap_or("without code"));
        if level.process.id == thrower.process.id {
            let mut failure = Failure::non_retryable(reason);
            if let Some(code) = code {
                failure = failure.with_code(code);
            }
            return self.fail_execution(activity_id, failure, Map::new()).await;
        }
        self.incident_process(level.process.id, reason).await
    }

    /// Terminate the call activity an error passed, then run the caller's handler
    ///
    /// A boundary on the call needs its host active, so it fires first and the
    /// call is terminated after it.
    async fn handle_at_caller(
        &self,
        level: &Level,
        call: Uuid,
        handler: &str,
    ) -> Result<CommandOutcome, EngineError> {
        let handler_def = level.definition.require(handler)?;
        if handler_def.attached_to.as_deref() != Some(level.anchor.as_str()) {
            self.terminate_execution(call, true).await?;
            return self.trigger(level.process.id, handler, Map::new()).await;
        }

        let outcome = self.trigger(level.process.id, handler, Map::new()).await?;
        if !self.terminate_execution(call, true).await?.is_skipped() {
            let command = match &level.definition.require(&level.anchor)?.parent_id {
                Some(container) => Command::CompleteScope {
                    process_id: level.process.id,
                    definition_id: container.clone(),
                },
                None => Command::CompleteProcess {
                    process_id: level.process.id,
                },
            };
            self.dispatcher.dispatch(command);
        }
        Ok(outcome)
    }

    /// Route a thrown escalation to its nearest handler
    ///
    /// A non-interrupting handler completes the thrower in place, leaving its
    /// outgoing flows untaken. Without a handler the thrower advances.
    #[instrument(skip(self))]
    pub(crate) async fn correlate_escalation(
        &self,
        activity_id: Uuid,
        escalation_code: Option<String>,
    ) -> Result<CommandOutcome, EngineError> {
        let thrower = self.load(activity_id).await?;
        if thrower.execution.is_in_terminal_state() {
            return Ok(CommandOutcome::Skipped);
        }
        let code = escalation_code.as_deref();

        let mut level = Level {
            process: thrower.process.clone(),
            definition: Arc::clone(&thrower.definition),
            anchor: thrower.execution.definition_id.clone(),
        };

        loop {
            if let Some(handler) = find_escalation_handler(&level.definition, &level.anchor, code)? {
                let interrupting = level.definition.require(&handler)?.is_interrupting();
                info!(
                    process_id = %level.process.id,
                    handler = %handler,
                    interrupting,
                    "Escalation correlated"
                );
                let outcome = self.trigger(level.process.id, &handler, Map::new()).await?;
                if outcome.is_skipped() {
                    self.complete_execution(activity_id, Map::new()).await?;
                } else if !interrupting {
                    self.complete_in_place(activity_id).await?;
                }
                return Ok(outcome);
            }

            match self.caller(&level).await? {
                Some((upper, _)) => level = upper,
                None => break,
            }
        }

        debug!(escalation_code = ?code, "Escalation not handled");
        self.complete_execution(activity_id, Map::new()).await
    }

    /// Deliver a message to the single process waiting for it
    #[instrument(skip(self, request), fields(message = %request.message))]
    pub(crate) async fn correlate_message(
        &self,
        request: MessageCorrelation,
    ) -> Result<Process, EngineError> {
        let message = request.message.clone();
        let candidates = match (&request.business_key, request.correlation_keys.is_empty()) {
            (None, true) => return Err(CorrelationError::MissingCriteria { message }.into()),
            (Some(key), true) => self.processes.find_by_business_key(key).await?,
            (Some(key), false) => {
                self.processes
                    .find_by_business_key_and_variables(key, &request.correlation_keys)
                    .await?
            }
            (None, false) => {
                self.processes
                    .find_by_variables(&request.correlation_keys)
                    .await?
            }
        };

        let mut matching = vec![];
        for process in candidates {
            let definition = self.definitions.find_definition(process.definition_id).await?;
            if definition.declares_message(&message) {
                matching.push((process, definition));
            }
        }

        let (process, definition) = match matching.len() {
            0 => return Err(CorrelationError::NoProcessCorrelated { message }.into()),
            1 => matching.remove(0),
            count => {
                return Err(CorrelationError::MultipleProcessesCorrelated { message, count }.into())
            }
        };
        if process.state.is_terminal() {
            return Err(CorrelationError::InvalidProcessState {
                message,
                process_id: process.id,
                state: process.state,
            }
            .into());
        }

        info!(process_id = %process.id, "Message correlated");
        self.save_process_variables(&process, request.variables)
            .await?;

        let receivers: Vec<String> = definition
            .message_events(&message)
            .into_iter()
            .map(|a| a.id.clone())
            .collect();
        for receiver in receivers {
            self.trigger(process.id, &receiver, Map::new()).await?;
        }
        Ok(process)
    }

    /// Trigger conditional events whose condition became true
    ///
    /// Only events that see one of the changed `scopes` are evaluated.
    #[instrument(skip(self))]
    pub(crate) async fn correlate_variables(
        &self,
        process_id: Uuid,
        scopes: &[String],
    ) -> Result<CommandOutcome, EngineError> {
        let (process, definition) = self.process_context(process_id).await?;
        if process.state.is_terminal() {
            return Ok(CommandOutcome::Skipped);
        }

        let mut fired = 0;
        for event in definition.conditional_events() {
            let Some(condition) = event.condition.as_deref() else {
                continue;
            };
            let chain = definition.scope(&event.id)?;
            if !chain.iter().any(|s| scopes.contains(s)) {
                continue;
            }

            let visible = self.visible_variables(process_id, &chain).await?;
            match self.evaluator.evaluate_boolean(condition, &visible) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(definition_id = %event.id, error = %e, "Condition not evaluable");
                    continue;
                }
            }

            debug!(definition_id = %event.id, "Condition met");
            if !self
                .trigger(process_id, &event.id, Map::new())
                .await?
                .is_skipped()
            {
                fired += 1;
            }
        }

        Ok(if fired == 0 {
            CommandOutcome::Skipped
        } else {
            CommandOutcome::Done
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActivityDefinition, ActivityType};

    fn guarded() -> ProcessDefinition {
        ProcessDefinition::builder("guarded")
            .activity(ActivityDefinition::new("start", ActivityType::StartEvent))
            .activity(ActivityDefinition::new("sub", ActivityType::SubProcess))
            .activity(ActivityDefinition::new("inner_start", ActivityType::StartEvent).with_parent("sub"))
            .activity(
                ActivityDefinition::new("fail", ActivityType::ErrorEndEvent)
                    .with_parent("sub")
                    .with_error_code("E1"),
            )
            .activity(
                ActivityDefinition::boundary("catch_e2", ActivityType::ErrorBoundaryEvent, "sub")
                    .with_error_code("E2"),
            )
            .activity(ActivityDefinition::new("end", ActivityType::EndEvent))
            .activity(ActivityDefinition::new("recovered", ActivityType::EndEvent))
            .activity(ActivityDefinition::new("esp", ActivityType::EventSubProcess))
            .activity(
                ActivityDefinition::new("on_error", ActivityType::ErrorStartEvent)
                    .with_parent("esp")
                    .with_error_code("E1"),
            )
            .activity(ActivityDefinition::new("esp_end", ActivityType::EndEvent).with_parent("esp"))
            .flow("start", "sub")
            .flow("inner_start", "fail")
            .flow("sub", "end")
            .flow("catch_e2", "recovered")
            .flow("on_error", "esp_end")
            .build()
            .unwrap()
    }

    #[test]
    fn test_boundary_with_other_code_is_skipped() {
        let definition = guarded();
        let handler = find_error_handler(&definition, "fail", Some("E1")).unwrap();
        assert_eq!(handler.as_deref(), Some("on_error"));

        let handler = find_error_handler(&definition, "fail", Some("E2")).unwrap();
        assert_eq!(handler.as_deref(), Some("catch_e2"));

        let handler = find_error_handler(&definition, "fail", Some("E3")).unwrap();
        assert_eq!(handler, None);
    }

    #[test]
    fn test_no_escalation_handler() {
        let definition = guarded();
        assert_eq!(find_escalation_handler(&definition, "fail", None).unwrap(), None);
    }

    #[test]
    fn test_message_correlation_builder() {
        let request = MessageCorrelation::new("paid")
            .with_business_key("order-1")
            .with_correlation_key("order", Value::from(7))
            .with_variable("amount", Value::from(10));

        assert_eq!(request.business_key.as_deref(), Some("order-1"));
        assert_eq!(request.correlation_keys.len(), 1);
        assert_eq!(request.variables.len(), 1);
    }
}
