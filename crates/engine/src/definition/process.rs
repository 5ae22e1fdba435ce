//! Process definitions and modeling errors

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityDefinition, ActivityType, ProcessDefinitionBuilder};

/// Modeling errors
///
/// These indicate an invalid process definition. They abort the command that
/// hit them and are never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("process definition {key} has no start event")]
    MissingStartActivity { key: String },

    #[error("process definition {key} has {count} start events in scope {scope}")]
    MultipleStartActivities {
        key: String,
        scope: String,
        count: usize,
    },

    #[error("activity {activity_id} not found in process definition {key}")]
    ActivityNotFound { key: String, activity_id: String },

    #[error("duplicate activity id {activity_id} in process definition {key}")]
    DuplicateActivity { key: String, activity_id: String },

    #[error("flow {from} -> {target} in process definition {key} references an unknown activity")]
    DanglingFlow {
        key: String,
        from: String,
        target: String,
    },

    #[error("activity {activity_id} in process definition {key}: {reason}")]
    InvalidActivity {
        key: String,
        activity_id: String,
        reason: String,
    },

    #[error("exclusive gateway {gateway} matched no outgoing path")]
    NoExclusivePath { gateway: String },

    #[error("exclusive gateway {gateway} matched {count} outgoing paths")]
    MultipleExclusivePaths { gateway: String, count: usize },

    #[error("inclusive gateway {gateway} matched no outgoing path")]
    EmptyInclusiveResult { gateway: String },

    #[error("no behavior registered for activity type {0}")]
    MissingBehavior(ActivityType),
}

/// A versioned process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,

    /// Stable across versions
    pub key: String,

    pub version: u32,

    #[serde(default)]
    pub name: Option<String>,

    pub activities: Vec<ActivityDefinition>,

    /// Declared message names
    #[serde(default)]
    pub messages: Vec<String>,

    /// Declared error codes
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ProcessDefinition {
    /// Start building a definition with the given key
    pub fn builder(key: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(key)
    }

    /// Identifier of the outermost variable scope
    pub fn root_scope(&self) -> &str {
        &self.key
    }

    pub fn activity(&self, id: &str) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| a.id == id)
    }

    /// Look up an activity, treating a miss as a modeling error
    pub fn require(&self, id: &str) -> Result<&ActivityDefinition, ModelError> {
        self.activity(id).ok_or_else(|| ModelError::ActivityNotFound {
            key: self.key.clone(),
            activity_id: id.to_string(),
        })
    }

    /// Scope chain of an activity, nearest first
    ///
    /// The chain starts with the activity itself, walks every enclosing
    /// sub-process and ends with the root scope.
    pub fn scope(&self, activity_id: &str) -> Result<Vec<String>, ModelError> {
        let mut chain = vec![];
        let mut current = Some(self.require(activity_id)?);
        while let Some(activity) = current {
            chain.push(activity.id.clone());
            current = match &activity.parent_id {
                Some(parent) => Some(self.require(parent)?),
                None => None,
            };
        }
        chain.push(self.root_scope().to_string());
        Ok(chain)
    }

    /// The unique top-level none start event
    pub fn start_activity(&self) -> Result<&ActivityDefinition, ModelError> {
        self.start_activity_in(None)
    }

    /// The unique none start event directly inside `container` (or the root)
    pub fn start_activity_in(&self, container: Option<&str>) -> Result<&ActivityDefinition, ModelError> {
        let starts: Vec<_> = self
            .children(container)
            .into_iter()
            .filter(|a| a.activity_type == ActivityType::StartEvent)
            .collect();

        match starts.as_slice() {
            [start] => Ok(*start),
            [] => Err(ModelError::MissingStartActivity {
                key: self.key.clone(),
            }),
            many => Err(ModelError::MultipleStartActivities {
                key: self.key.clone(),
                scope: container.unwrap_or(&self.key).to_string(),
                count: many.len(),
            }),
        }
    }

    /// Activities directly inside `container` (`None` for the root)
    pub fn children(&self, container: Option<&str>) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.parent_id.as_deref() == container)
            .collect()
    }

    /// Every activity nested anywhere inside `container`
    pub fn descendants(&self, container: &str) -> Vec<&ActivityDefinition> {
        let mut found = vec![];
        let mut frontier = vec![container.to_string()];
        while let Some(parent) = frontier.pop() {
            for child in self.children(Some(parent.as_str())) {
                frontier.push(child.id.clone());
                found.push(child);
            }
        }
        found
    }

    /// Boundary events attached to an activity
    pub fn boundaries_of(&self, activity_id: &str) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.attached_to.as_deref() == Some(activity_id))
            .collect()
    }

    /// Event sub-processes directly inside `container` (`None` for the root)
    pub fn event_sub_processes(&self, container: Option<&str>) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| {
                a.parent_id.as_deref() == container
                    && a.activity_type == ActivityType::EventSubProcess
            })
            .collect()
    }

    pub fn next_activities(&self, activity_id: &str) -> Result<Vec<&ActivityDefinition>, ModelError> {
        self.require(activity_id)?
            .outgoing
            .iter()
            .map(|id| self.require(id))
            .collect()
    }

    pub fn previous_activities(
        &self,
        activity_id: &str,
    ) -> Result<Vec<&ActivityDefinition>, ModelError> {
        self.require(activity_id)?
            .incoming
            .iter()
            .map(|id| self.require(id))
            .collect()
    }

    /// Activities that react to the named message
    pub fn message_events(&self, message: &str) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.message_ref.as_deref() == Some(message))
            .collect()
    }

    /// Activities that trigger on a boolean condition
    pub fn conditional_events(&self) -> impl Iterator<Item = &ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.activity_type.is_conditional())
    }

    pub fn declares_message(&self, message: &str) -> bool {
        self.messages.iter().any(|m| m == message)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |activity_id: &str, reason: &str| ModelError::InvalidActivity {
            key: self.key.clone(),
            activity_id: activity_id.to_string(),
            reason: reason.to_string(),
        };

        let mut ids = HashSet::new();
        for activity in &self.activities {
            if !ids.insert(activity.id.as_str()) {
                return Err(ModelError::DuplicateActivity {
                    key: self.key.clone(),
                    activity_id: activity.id.clone(),
                });
            }
        }

        for activity in &self.activities {
            if let Some(parent) = &activity.parent_id {
                let container = self.require(parent)?;
                if !container.activity_type.is_container() {
                    return Err(invalid(&activity.id, "parent is not a sub-process"));
                }
            }

            for target in &activity.outgoing {
                let next = self.activity(target).ok_or_else(|| ModelError::DanglingFlow {
                    key: self.key.clone(),
                    from: activity.id.clone(),
                    target: target.clone(),
                })?;
                if !next.incoming.contains(&activity.id) {
                    return Err(ModelError::DanglingFlow {
                        key: self.key.clone(),
                        from: activity.id.clone(),
                        target: target.clone(),
                    });
                }
            }

            for source in &activity.incoming {
                if self.activity(source).is_none() {
                    return Err(ModelError::DanglingFlow {
                        key: self.key.clone(),
                        from: source.clone(),
                        target: activity.id.clone(),
                    });
                }
            }

            self.validate_activity(activity, &invalid)?;
        }

        self.start_activity()?;
        Ok(())
    }

    fn validate_activity(
        &self,
        activity: &ActivityDefinition,
        invalid: &dyn Fn(&str, &str) -> ModelError,
    ) -> Result<(), ModelError> {
        let ty = activity.activity_type;

        if ty.is_boundary_event() {
            let host = activity
                .attached_to
                .as_deref()
                .ok_or_else(|| invalid(&activity.id, "boundary event is not attached"))?;
            self.require(host)?;
        } else if activity.attached_to.is_some() {
            return Err(invalid(&activity.id, "only boundary events can be attached"));
        }

        if ty.is_event_start() {
            let parent = activity.parent_id.as_deref().and_then(|p| self.activity(p));
            if !matches!(parent, Some(p) if p.activity_type == ActivityType::EventSubProcess) {
                return Err(invalid(&activity.id, "event start must live in an event sub-process"));
            }
        }

        match ty {
            ActivityType::ServiceTask if activity.topic.is_none() => {
                Err(invalid(&activity.id, "service task needs a topic"))
            }
            ActivityType::CallActivity if activity.call.is_none() => {
                Err(invalid(&activity.id, "call activity needs a called element"))
            }
            ActivityType::TimerCatchEvent | ActivityType::TimerBoundaryEvent
                if activity.timer.is_none() =>
            {
                Err(invalid(&activity.id, "timer event needs a duration"))
            }
            _ if ty.is_conditional() && activity.condition.is_none() => {
                Err(invalid(&activity.id, "conditional event needs a condition"))
            }
            _ if ty.is_message_event() && activity.message_ref.is_none() => {
                Err(invalid(&activity.id, "message event needs a message reference"))
            }
            ActivityType::SubProcess => self
                .start_activity_in(Some(&activity.id))
                .map(|_| ()),
            ActivityType::EventSubProcess => {
                let starts = self
                    .children(Some(&activity.id))
                    .into_iter()
                    .filter(|a| a.activity_type.is_event_start())
                    .count();
                if starts == 1 {
                    Ok(())
                } else {
                    Err(invalid(&activity.id, "event sub-process needs exactly one event start"))
                }
            }
            ActivityType::ExclusiveGateway | ActivityType::InclusiveGateway => {
                match activity
                    .conditions
                    .iter()
                    .find(|flow| !activity.outgoing.contains(&flow.target))
                {
                    Some(flow) => Err(invalid(
                        &activity.id,
                        &format!("condition targets {} which is not an outgoing flow", flow.target),
                    )),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ActivityDefinition as Def;

    fn nested() -> ProcessDefinition {
        ProcessDefinition::builder("nested")
            .activity(Def::new("start", ActivityType::StartEvent))
            .activity(Def::new("sub", ActivityType::SubProcess))
            .activity(Def::new("sub_start", ActivityType::StartEvent).with_parent("sub"))
            .activity(Def::new("inner", ActivityType::Task).with_parent("sub"))
            .activity(Def::new("sub_end", ActivityType::EndEvent).with_parent("sub"))
            .activity(Def::new("end", ActivityType::EndEvent))
            .flow("start", "sub")
            .flow("sub_start", "inner")
            .flow("inner", "sub_end")
            .flow("sub", "end")
            .build()
            .expect("valid definition")
    }

    #[test]
    fn test_scope_chain_nearest_first() {
        let definition = nested();

        assert_eq!(
            definition.scope("inner").unwrap(),
            vec!["inner", "sub", "nested"]
        );
        assert_eq!(definition.scope("end").unwrap(), vec!["end", "nested"]);
    }

    #[test]
    fn test_scope_of_unknown_activity() {
        let definition = nested();
        assert!(matches!(
            definition.scope("missing"),
            Err(ModelError::ActivityNotFound { .. })
        ));
    }

    #[test]
    fn test_start_activities() {
        let definition = nested();
        assert_eq!(definition.start_activity().unwrap().id, "start");
        assert_eq!(definition.start_activity_in(Some("sub")).unwrap().id, "sub_start");
    }

    #[test]
    fn test_descendants() {
        let definition = nested();
        let mut ids: Vec<_> = definition
            .descendants("sub")
            .into_iter()
            .map(|a| a.id.as_str())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["inner", "sub_end", "sub_start"]);
    }

    #[test]
    fn test_missing_start_rejected() {
        let result = ProcessDefinition::builder("broken")
            .activity(Def::new("task", ActivityType::Task))
            .build();
        assert!(matches!(result, Err(ModelError::MissingStartActivity { .. })));
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let result = ProcessDefinition::builder("broken")
            .activity(Def::new("a", ActivityType::StartEvent))
            .activity(Def::new("b", ActivityType::StartEvent))
            .build();
        assert!(matches!(
            result,
            Err(ModelError::MultipleStartActivities { count: 2, .. })
        ));
    }

    #[test]
    fn test_event_start_outside_event_sub_process_rejected() {
        let result = ProcessDefinition::builder("broken")
            .activity(Def::new("start", ActivityType::StartEvent))
            .activity(Def::new("on_error", ActivityType::ErrorStartEvent))
            .build();
        assert!(matches!(result, Err(ModelError::InvalidActivity { .. })));
    }

    #[test]
    fn test_service_task_requires_topic() {
        let result = ProcessDefinition::builder("broken")
            .activity(Def::new("start", ActivityType::StartEvent))
            .activity(Def::new("work", ActivityType::ServiceTask))
            .flow("start", "work")
            .build();
        assert!(matches!(result, Err(ModelError::InvalidActivity { .. })));
    }
}
