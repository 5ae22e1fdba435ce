//! Activity executions: runtime state of one activity node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::Process;
use crate::definition::{ActivityDefinition, ActivityType, ModelError, ProcessDefinition};

/// Activity execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    /// Created, inputs not yet resolved
    Scheduled,

    /// Running or waiting for an external signal
    Active,

    Completed,

    /// Failed; may be retried
    Failed,

    /// Canceled or terminated by a competing branch
    Terminated,

    /// Administratively removed (migration)
    Deleted,
}

impl ActivityState {
    /// Whether the execution can never change again
    ///
    /// FAILED is not terminal: a retry moves it back to ACTIVE.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Deleted)
    }

    /// Whether the execution no longer blocks scope completion
    pub fn is_settled(&self) -> bool {
        self.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Active)
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Terminated => write!(f, "TERMINATED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Failure detail of an activity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Failure {
    pub message: String,

    /// Error code for correlation with error handlers
    pub error_code: Option<String>,

    /// Whether automatic retries apply
    pub retryable: bool,

    pub details: Option<Value>,
}

impl Failure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            retryable: true,
            details: None,
        }
    }

    /// Failure that skips remaining retries
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Failure {}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Claim held by an external worker on a polled task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLock {
    pub worker_id: String,
    pub locked_until: DateTime<Utc>,
}

impl ExternalLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_until <= now
    }
}

/// Runtime record of one activity of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityExecution {
    pub id: Uuid,
    pub process_id: Uuid,

    /// Definition of the owning process
    pub process_definition_id: Uuid,
    pub process_definition_key: String,

    /// Activity id within the process definition
    pub definition_id: String,
    pub activity_type: ActivityType,

    /// External task topic (service tasks)
    pub topic: Option<String>,

    pub state: ActivityState,

    /// Automatic retries left
    pub retries: u32,

    pub failure: Option<Failure>,
    pub lock: Option<ExternalLock>,

    /// Resolved input variables
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Store-assigned completion order within the process, 0 until completed
    #[serde(default)]
    pub completion_sequence: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ActivityExecution {
    /// New SCHEDULED execution of `definition` in `process`
    pub fn new(id: Uuid, process: &Process, definition: &ActivityDefinition) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_id: process.id,
            process_definition_id: process.definition_id,
            process_definition_key: process.definition_key.clone(),
            definition_id: definition.id.clone(),
            activity_type: definition.activity_type,
            topic: definition.topic.clone(),
            state: ActivityState::Scheduled,
            retries: definition.retries,
            failure: None,
            lock: None,
            variables: Map::new(),
            completion_sequence: 0,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Scope chain of this activity, nearest first
    pub fn scope(&self, definition: &ProcessDefinition) -> Result<Vec<String>, ModelError> {
        definition.scope(&self.definition_id)
    }

    pub fn definition<'a>(
        &self,
        definition: &'a ProcessDefinition,
    ) -> Result<&'a ActivityDefinition, ModelError> {
        definition.require(&self.definition_id)
    }

    pub fn previous_activities<'a>(
        &self,
        definition: &'a ProcessDefinition,
    ) -> Result<Vec<&'a ActivityDefinition>, ModelError> {
        definition.previous_activities(&self.definition_id)
    }

    pub fn next_activities<'a>(
        &self,
        definition: &'a ProcessDefinition,
    ) -> Result<Vec<&'a ActivityDefinition>, ModelError> {
        definition.next_activities(&self.definition_id)
    }

    /// Whether completion arrives from outside the engine
    pub fn is_async(&self) -> bool {
        self.activity_type.is_wait_state()
    }

    pub fn is_in_terminal_state(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state == ActivityState::Active
    }
}
