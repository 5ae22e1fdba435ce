//! Fluent assembly of process definitions

use uuid::Uuid;

use super::{ActivityDefinition, ConditionalFlow, ModelError, ProcessDefinition};

/// Builder for [`ProcessDefinition`]
///
/// Flows are recorded on both ends so `incoming` and `outgoing` stay in sync.
/// The id and version are placeholders until the definition is deployed.
#[derive(Debug)]
pub struct ProcessDefinitionBuilder {
    key: String,
    name: Option<String>,
    activities: Vec<ActivityDefinition>,
    flows: Vec<(String, String, Option<String>)>,
    messages: Vec<String>,
    errors: Vec<String>,
}

impl ProcessDefinitionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            activities: vec![],
            flows: vec![],
            messages: vec![],
            errors: vec![],
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn activity(mut self, activity: ActivityDefinition) -> Self {
        self.activities.push(activity);
        self
    }

    /// Unconditional sequence flow
    pub fn flow(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.flows.push((source.into(), target.into(), None));
        self
    }

    /// Gateway flow guarded by `condition`
    pub fn conditional_flow(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.flows
            .push((source.into(), target.into(), Some(condition.into())));
        self
    }

    /// Gateway default flow
    pub fn default_flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.conditional_flow(source, target, "")
    }

    /// Declare a message name (message events declare theirs implicitly)
    pub fn message(mut self, name: impl Into<String>) -> Self {
        self.messages.push(name.into());
        self
    }

    /// Declare an error code (error events declare theirs implicitly)
    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.errors.push(code.into());
        self
    }

    /// Wire flows and validate the result
    pub fn build(self) -> Result<ProcessDefinition, ModelError> {
        let Self {
            key,
            name,
            mut activities,
            flows,
            mut messages,
            mut errors,
        } = self;

        for (source, target, condition) in flows {
            let dangling = || ModelError::DanglingFlow {
                key: key.clone(),
                from: source.clone(),
                target: target.clone(),
            };

            let source_index = activities
                .iter()
                .position(|a| a.id == source)
                .ok_or_else(dangling)?;
            let target_index = activities
                .iter()
                .position(|a| a.id == target)
                .ok_or_else(dangling)?;

            let from = &mut activities[source_index];
            if !from.outgoing.contains(&target) {
                from.outgoing.push(target.clone());
            }
            if let Some(condition) = condition {
                from.conditions.push(ConditionalFlow::new(condition, target.clone()));
            }

            let to = &mut activities[target_index];
            if !to.incoming.contains(&source) {
                to.incoming.push(source.clone());
            }
        }

        for activity in &activities {
            if let Some(message) = &activity.message_ref {
                if !messages.contains(message) {
                    messages.push(message.clone());
                }
            }
            if let Some(code) = &activity.error_code {
                if !errors.contains(code) {
                    errors.push(code.clone());
                }
            }
        }

        let definition = ProcessDefinition {
            id: Uuid::nil(),
            key,
            version: 0,
            name,
            activities,
            messages,
            errors,
        };
        definition.validate()?;
        Ok(definition)
    }
}
