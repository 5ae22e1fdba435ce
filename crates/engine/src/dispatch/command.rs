//! Commands: intents with exactly one handler

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::runtime::{ActivityExecution, Failure, ParentLink, Process};

/// How a start request names its definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum DefinitionRef {
    Id { id: Uuid },

    /// Latest version when `version` is `None`
    Key { key: String, version: Option<u32> },
}

/// Parameters of a new process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub definition: DefinitionRef,
    pub business_key: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub parent: Option<ParentLink>,
}

impl StartRequest {
    /// Start the latest version of `key`
    pub fn by_key(key: impl Into<String>) -> Self {
        Self::new(DefinitionRef::Key {
            key: key.into(),
            version: None,
        })
    }

    pub fn by_id(id: Uuid) -> Self {
        Self::new(DefinitionRef::Id { id })
    }

    fn new(definition: DefinitionRef) -> Self {
        Self {
            definition,
            business_key: None,
            variables: Map::new(),
            parent: None,
        }
    }

    /// Pin the version of a key reference
    pub fn with_version(mut self, pinned: u32) -> Self {
        if let DefinitionRef::Key { version, .. } = &mut self.definition {
            *version = Some(pinned);
        }
        self
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub(crate) fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Engine command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    StartProcess(StartRequest),

    /// Schedule and run a new execution of an activity definition
    RunActivity {
        process_id: Uuid,
        definition_id: String,
    },

    /// Run an execution that is already SCHEDULED
    ExecuteActivity { activity_id: Uuid },

    /// Re-run a FAILED execution
    RetryActivity { activity_id: Uuid },

    CompleteActivity {
        activity_id: Uuid,
        #[serde(default)]
        variables: Map<String, Value>,
    },

    FailActivity {
        activity_id: Uuid,
        failure: Failure,
        #[serde(default)]
        variables: Map<String, Value>,
    },

    CancelActivity { activity_id: Uuid },

    TerminateActivity { activity_id: Uuid, propagate: bool },

    /// Run an activity that sits off the normal flow (boundary, event start, catch)
    TriggerActivity {
        process_id: Uuid,
        definition_id: String,
        #[serde(default)]
        variables: Map<String, Value>,
    },

    /// Complete a sub-process once nothing inside it is pending
    CompleteScope {
        process_id: Uuid,
        definition_id: String,
    },

    CompleteProcess { process_id: Uuid },
    CancelProcess { process_id: Uuid },
    TerminateProcess { process_id: Uuid },
    IncidentProcess { process_id: Uuid, reason: String },
    RecoverProcess { process_id: Uuid },

    CorrelateError {
        activity_id: Uuid,
        error_code: Option<String>,
    },

    CorrelateEscalation {
        activity_id: Uuid,
        escalation_code: Option<String>,
    },

    /// Evaluate conditional events after variables changed in `scopes`
    CorrelateVariables { process_id: Uuid, scopes: Vec<String> },
}

impl Command {
    /// Stable name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartProcess(_) => "start_process",
            Self::RunActivity { .. } => "run_activity",
            Self::ExecuteActivity { .. } => "execute_activity",
            Self::RetryActivity { .. } => "retry_activity",
            Self::CompleteActivity { .. } => "complete_activity",
            Self::FailActivity { .. } => "fail_activity",
            Self::CancelActivity { .. } => "cancel_activity",
            Self::TerminateActivity { .. } => "terminate_activity",
            Self::TriggerActivity { .. } => "trigger_activity",
            Self::CompleteScope { .. } => "complete_scope",
            Self::CompleteProcess { .. } => "complete_process",
            Self::CancelProcess { .. } => "cancel_process",
            Self::TerminateProcess { .. } => "terminate_process",
            Self::IncidentProcess { .. } => "incident_process",
            Self::RecoverProcess { .. } => "recover_process",
            Self::CorrelateError { .. } => "correlate_error",
            Self::CorrelateEscalation { .. } => "correlate_escalation",
            Self::CorrelateVariables { .. } => "correlate_variables",
        }
    }
}

/// Result of a handled command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Done,

    /// The target was already settled; nothing changed
    Skipped,

    Process(Process),
    Activity(ActivityExecution),
}

impl CommandOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn into_process(self) -> Option<Process> {
        match self {
            Self::Process(process) => Some(process),
            _ => None,
        }
    }
}
