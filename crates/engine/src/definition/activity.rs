//! Activity definitions: the immutable nodes of a process graph

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Activity type tag
///
/// The set is closed: every variant must have exactly one behavior registered
/// in the [`BehaviorResolver`](crate::behavior::BehaviorResolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    // Start events
    StartEvent,
    MessageStartEvent,
    ErrorStartEvent,
    EscalationStartEvent,
    ConditionalStartEvent,

    // End events
    EndEvent,
    TerminateEndEvent,
    ErrorEndEvent,
    EscalationEndEvent,

    // Intermediate events
    MessageCatchEvent,
    TimerCatchEvent,
    ConditionalCatchEvent,
    EscalationThrowEvent,
    ThrowEvent,

    // Boundary events
    ErrorBoundaryEvent,
    EscalationBoundaryEvent,
    MessageBoundaryEvent,
    TimerBoundaryEvent,
    ConditionalBoundaryEvent,

    // Tasks
    Task,
    ServiceTask,
    UserTask,

    // Gateways
    ExclusiveGateway,
    InclusiveGateway,
    ParallelGateway,
    EventBasedGateway,

    // Containers
    SubProcess,
    EventSubProcess,
    CallActivity,
}

impl ActivityType {
    /// Every activity type, in declaration order
    pub const ALL: [ActivityType; 29] = [
        Self::StartEvent,
        Self::MessageStartEvent,
        Self::ErrorStartEvent,
        Self::EscalationStartEvent,
        Self::ConditionalStartEvent,
        Self::EndEvent,
        Self::TerminateEndEvent,
        Self::ErrorEndEvent,
        Self::EscalationEndEvent,
        Self::MessageCatchEvent,
        Self::TimerCatchEvent,
        Self::ConditionalCatchEvent,
        Self::EscalationThrowEvent,
        Self::ThrowEvent,
        Self::ErrorBoundaryEvent,
        Self::EscalationBoundaryEvent,
        Self::MessageBoundaryEvent,
        Self::TimerBoundaryEvent,
        Self::ConditionalBoundaryEvent,
        Self::Task,
        Self::ServiceTask,
        Self::UserTask,
        Self::ExclusiveGateway,
        Self::InclusiveGateway,
        Self::ParallelGateway,
        Self::EventBasedGateway,
        Self::SubProcess,
        Self::EventSubProcess,
        Self::CallActivity,
    ];

    /// Start events that are only reached through correlation
    pub fn is_event_start(&self) -> bool {
        matches!(
            self,
            Self::MessageStartEvent
                | Self::ErrorStartEvent
                | Self::EscalationStartEvent
                | Self::ConditionalStartEvent
        )
    }

    pub fn is_start_event(&self) -> bool {
        *self == Self::StartEvent || self.is_event_start()
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(
            self,
            Self::ErrorBoundaryEvent
                | Self::EscalationBoundaryEvent
                | Self::MessageBoundaryEvent
                | Self::TimerBoundaryEvent
                | Self::ConditionalBoundaryEvent
        )
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            Self::ExclusiveGateway
                | Self::InclusiveGateway
                | Self::ParallelGateway
                | Self::EventBasedGateway
        )
    }

    /// Intermediate events that park until a message, timer or condition fires
    pub fn is_catch_event(&self) -> bool {
        matches!(
            self,
            Self::MessageCatchEvent | Self::TimerCatchEvent | Self::ConditionalCatchEvent
        )
    }

    /// Activities that own nested activities
    pub fn is_container(&self) -> bool {
        matches!(self, Self::SubProcess | Self::EventSubProcess)
    }

    /// Activities whose completion arrives from outside the engine
    pub fn is_wait_state(&self) -> bool {
        matches!(self, Self::ServiceTask | Self::UserTask | Self::CallActivity) || self.is_catch_event()
    }

    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            Self::ConditionalStartEvent | Self::ConditionalCatchEvent | Self::ConditionalBoundaryEvent
        )
    }

    /// Activities that declare a message reference
    pub fn is_message_event(&self) -> bool {
        matches!(
            self,
            Self::MessageStartEvent | Self::MessageCatchEvent | Self::MessageBoundaryEvent
        )
    }

    /// Handlers for thrown errors
    pub fn is_error_handler(&self) -> bool {
        matches!(self, Self::ErrorStartEvent | Self::ErrorBoundaryEvent)
    }

    /// Handlers for thrown escalations
    pub fn is_escalation_handler(&self) -> bool {
        matches!(self, Self::EscalationStartEvent | Self::EscalationBoundaryEvent)
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde names double as the stable string form
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&name)
    }
}

/// Outgoing flow of an exclusive or inclusive gateway
///
/// An empty `condition` marks the default path. The sentinel is kept as-is so
/// existing definitions resolve the same way: a condition that is literally
/// empty and "no condition" are indistinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalFlow {
    pub condition: String,
    pub target: String,
}

impl ConditionalFlow {
    pub fn new(condition: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            target: target.into(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.condition.is_empty()
    }
}

/// Input or output mapping of an activity
///
/// `source` is either an expression (`${...}`) evaluated against the scoped
/// variables or a literal string value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub target: String,
    pub source: String,
}

impl VariableMapping {
    pub fn new(target: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
        }
    }
}

/// Variable passing rule between a call activity and its called process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallMapping {
    /// Copy `source` to `target` unchanged
    Copy { source: String, target: String },

    /// Evaluate `expression` against the source variables and store it as `target`
    Expression { expression: String, target: String },

    /// Pass every source variable through
    All,
}

/// Call activity configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallActivitySpec {
    /// Key of the called process definition
    pub called_element: String,

    /// Pinned version; `None` calls the latest deployed version
    #[serde(default)]
    pub version: Option<u32>,

    /// Parent to child variable mappings
    #[serde(default)]
    pub inputs: Vec<CallMapping>,

    /// Child to parent variable mappings
    #[serde(default)]
    pub outputs: Vec<CallMapping>,
}

impl CallActivitySpec {
    pub fn new(called_element: impl Into<String>) -> Self {
        Self {
            called_element: called_element.into(),
            version: None,
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_input(mut self, mapping: CallMapping) -> Self {
        self.inputs.push(mapping);
        self
    }

    pub fn with_output(mut self, mapping: CallMapping) -> Self {
        self.outputs.push(mapping);
        self
    }
}

/// One node of a process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityDefinition {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Enclosing sub-process or event sub-process
    #[serde(default)]
    pub parent_id: Option<String>,

    pub activity_type: ActivityType,

    #[serde(default)]
    pub incoming: Vec<String>,

    #[serde(default)]
    pub outgoing: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<VariableMapping>,

    #[serde(default)]
    pub outputs: Vec<VariableMapping>,

    /// Gateway conditions, evaluated in declared order
    #[serde(default)]
    pub conditions: Vec<ConditionalFlow>,

    /// Boolean condition of a conditional event
    #[serde(default)]
    pub condition: Option<String>,

    /// External task topic
    #[serde(default)]
    pub topic: Option<String>,

    /// Automatic retries before a failure raises an incident
    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub call: Option<CallActivitySpec>,

    #[serde(default)]
    pub error_code: Option<String>,

    #[serde(default)]
    pub escalation_code: Option<String>,

    #[serde(default)]
    pub message_ref: Option<String>,

    #[serde(default, with = "option_duration_millis")]
    pub timer: Option<Duration>,

    /// Host activity of a boundary event
    #[serde(default)]
    pub attached_to: Option<String>,

    /// Whether a boundary or event start cancels what it interrupts
    #[serde(default = "default_interrupting")]
    pub interrupting: bool,
}

fn default_interrupting() -> bool {
    true
}

impl ActivityDefinition {
    /// Create a bare definition of the given type
    pub fn new(id: impl Into<String>, activity_type: ActivityType) -> Self {
        Self {
            id: id.into(),
            name: None,
            parent_id: None,
            activity_type,
            incoming: vec![],
            outgoing: vec![],
            inputs: vec![],
            outputs: vec![],
            conditions: vec![],
            condition: None,
            topic: None,
            retries: 0,
            call: None,
            error_code: None,
            escalation_code: None,
            message_ref: None,
            timer: None,
            attached_to: None,
            interrupting: true,
        }
    }

    /// External task published on `topic`
    pub fn service_task(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::new(id, ActivityType::ServiceTask).with_topic(topic)
    }

    pub fn call_activity(id: impl Into<String>, spec: CallActivitySpec) -> Self {
        let mut definition = Self::new(id, ActivityType::CallActivity);
        definition.call = Some(spec);
        definition
    }

    pub fn boundary(
        id: impl Into<String>,
        activity_type: ActivityType,
        attached_to: impl Into<String>,
    ) -> Self {
        let mut definition = Self::new(id, activity_type);
        definition.attached_to = Some(attached_to.into());
        definition
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_input(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.inputs.push(VariableMapping::new(target, source));
        self
    }

    pub fn with_output(mut self, target: impl Into<String>, source: impl Into<String>) -> Self {
        self.outputs.push(VariableMapping::new(target, source));
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_escalation_code(mut self, code: impl Into<String>) -> Self {
        self.escalation_code = Some(code.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message_ref = Some(message.into());
        self
    }

    pub fn with_timer(mut self, duration: Duration) -> Self {
        self.timer = Some(duration);
        self
    }

    pub fn non_interrupting(mut self) -> Self {
        self.interrupting = false;
        self
    }

    /// Whether an error thrown with `code` is caught here
    ///
    /// A handler without a code catches every error.
    pub fn catches_error(&self, code: Option<&str>) -> bool {
        self.activity_type.is_error_handler()
            && match (&self.error_code, code) {
                (None, _) => true,
                (Some(expected), Some(code)) => expected == code,
                (Some(_), None) => false,
            }
    }

    /// Whether an escalation thrown with `code` is caught here
    pub fn catches_escalation(&self, code: Option<&str>) -> bool {
        self.activity_type.is_escalation_handler()
            && match (&self.escalation_code, code) {
                (None, _) => true,
                (Some(expected), Some(code)) => expected == code,
                (Some(_), None) => false,
            }
    }

    /// Error and escalation start events always interrupt
    pub fn is_interrupting(&self) -> bool {
        match self.activity_type {
            ActivityType::ErrorBoundaryEvent | ActivityType::ErrorStartEvent => true,
            _ => self.interrupting,
        }
    }
}

/// Serde support for optional Duration as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_listed_once() {
        let mut seen = std::collections::HashSet::new();
        for ty in ActivityType::ALL {
            assert!(seen.insert(ty), "{ty} listed twice");
        }
        assert_eq!(seen.len(), ActivityType::ALL.len());
    }

    #[test]
    fn test_display_uses_camel_case() {
        assert_eq!(ActivityType::ExclusiveGateway.to_string(), "exclusiveGateway");
        assert_eq!(ActivityType::ErrorEndEvent.to_string(), "errorEndEvent");
    }

    #[test]
    fn test_error_code_matching() {
        let specific = ActivityDefinition::boundary("b", ActivityType::ErrorBoundaryEvent, "task")
            .with_error_code("E1");
        assert!(specific.catches_error(Some("E1")));
        assert!(!specific.catches_error(Some("E2")));
        assert!(!specific.catches_error(None));

        let catch_all = ActivityDefinition::boundary("b", ActivityType::ErrorBoundaryEvent, "task");
        assert!(catch_all.catches_error(Some("anything")));

        let task = ActivityDefinition::new("t", ActivityType::Task).with_error_code("E1");
        assert!(!task.catches_error(Some("E1")));
    }

    #[test]
    fn test_error_handlers_always_interrupt() {
        let boundary =
            ActivityDefinition::boundary("b", ActivityType::ErrorBoundaryEvent, "task").non_interrupting();
        assert!(boundary.is_interrupting());

        let escalation =
            ActivityDefinition::boundary("e", ActivityType::EscalationBoundaryEvent, "task")
                .non_interrupting();
        assert!(!escalation.is_interrupting());
    }

    #[test]
    fn test_definition_serde_defaults() {
        let definition: ActivityDefinition = serde_json::from_value(serde_json::json!({
            "id": "wait",
            "activity_type": "timerCatchEvent",
            "timer": 1500
        }))
        .unwrap();

        assert_eq!(definition.timer, Some(Duration::from_millis(1500)));
        assert!(definition.interrupting);
        assert!(definition.outgoing.is_empty());
    }
}
