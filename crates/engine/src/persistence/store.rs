//! Persistence contracts
//!
//! The engine has no global lock. Every state change goes through a
//! compare-and-set transition here, and the predicates that guard scope
//! completion and joins are evaluated atomically by the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::runtime::{ActivityExecution, Failure, Process, ProcessState, Variable};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("process definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("activity not found: {0}")]
    ActivityNotFound(Uuid),

    #[error("variable {key} not found in process {process_id}")]
    VariableNotFound { process_id: Uuid, key: String },

    /// Compare-and-set transition lost against the current state
    #[error("invalid transition of {id} from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    /// Backend error
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

/// Treat a lost transition as "nothing happened"
pub fn optional_transition<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_invalid_transition() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Outcome of failing an activity
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// A retry was consumed; the activity re-enters through run
    WillRetry(ActivityExecution),

    /// No retries left; the activity stays FAILED
    Failed(ActivityExecution),
}

/// Outcome of a parallel join arrival
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    /// Every incoming branch arrived; the returned gateway execution completed
    Completed(ActivityExecution),

    /// Still waiting for other branches
    Waiting,

    /// Another arrival already completed this round
    AlreadyJoined,
}

/// Store for versioned process definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    /// Persist definitions, assigning each the next version of its key
    async fn save(
        &self,
        definitions: Vec<ProcessDefinition>,
    ) -> Result<Vec<Arc<ProcessDefinition>>, StoreError>;

    async fn find_definition(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, StoreError>;

    async fn find_by_key_and_version(
        &self,
        key: &str,
        version: u32,
    ) -> Result<Arc<ProcessDefinition>, StoreError>;

    async fn find_latest_by_key(&self, key: &str) -> Result<Arc<ProcessDefinition>, StoreError>;
}

/// Store for activity executions
#[async_trait]
pub trait ActivityStore: Send + Sync + 'static {
    /// Insert a SCHEDULED execution
    async fn schedule(&self, execution: ActivityExecution) -> Result<ActivityExecution, StoreError>;

    /// SCHEDULED, FAILED or ACTIVE to ACTIVE, storing resolved inputs
    ///
    /// Re-running an ACTIVE execution releases its external lock.
    async fn run(
        &self,
        id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<ActivityExecution, StoreError>;

    /// SCHEDULED or ACTIVE to COMPLETED
    ///
    /// `successors` are inserted SCHEDULED in the same atomic step, so the
    /// scope never looks settled between a completion and its continuation.
    /// A lost transition inserts nothing.
    async fn complete(
        &self,
        id: Uuid,
        successors: Vec<ActivityExecution>,
    ) -> Result<ActivityExecution, StoreError>;

    /// SCHEDULED or ACTIVE to FAILED, consuming a retry when one is left
    async fn fail(&self, id: Uuid, failure: Failure) -> Result<FailureOutcome, StoreError>;

    /// Any non-terminal state to TERMINATED
    async fn terminate(&self, id: Uuid) -> Result<ActivityExecution, StoreError>;

    /// Any state to DELETED
    async fn delete(&self, id: Uuid) -> Result<ActivityExecution, StoreError>;

    /// Atomically record a parallel gateway arrival
    ///
    /// The join fires when every `incoming` definition has a completion newer
    /// than the gateway's previous firing in this process. Only one arrival
    /// per round observes [`JoinOutcome::Completed`], and only that arrival
    /// inserts `successors`.
    async fn complete_join(
        &self,
        gateway_execution_id: Uuid,
        incoming: &[String],
        successors: Vec<ActivityExecution>,
    ) -> Result<JoinOutcome, StoreError>;

    async fn find_activity(&self, id: Uuid) -> Result<ActivityExecution, StoreError>;

    async fn find_by_definition_id(
        &self,
        process_id: Uuid,
        definition_id: &str,
    ) -> Result<Vec<ActivityExecution>, StoreError>;

    async fn find_by_process(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, StoreError>;

    /// SCHEDULED or ACTIVE executions, optionally limited to some definitions
    async fn find_active(
        &self,
        process_id: Uuid,
        definition_ids: Option<&[String]>,
    ) -> Result<Vec<ActivityExecution>, StoreError>;

    async fn find_failed(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, StoreError>;

    /// ACTIVE executions whose external lock expired before `now`
    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityExecution>, StoreError>;

    /// Whether no execution (optionally of the given definitions) still blocks completion
    async fn is_all_completed(
        &self,
        process_id: Uuid,
        definition_ids: Option<&[String]>,
    ) -> Result<bool, StoreError>;

    async fn is_any_failed(&self, process_id: Uuid) -> Result<bool, StoreError>;

    /// Claim unlocked ACTIVE external tasks for a worker
    ///
    /// Claimed tasks are locked until `locked_until`; tasks of suspended
    /// processes are skipped. A task is never handed to two pollers while
    /// its lock holds.
    async fn poll(
        &self,
        request: &PollRequest,
        locked_until: DateTime<Utc>,
    ) -> Result<Vec<ActivityExecution>, StoreError>;
}

/// External task poll parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub topic: String,
    pub process_definition_key: Option<String>,
    pub worker_id: String,
    pub limit: usize,
}

impl PollRequest {
    pub fn new(topic: impl Into<String>, worker_id: impl Into<String>, limit: usize) -> Self {
        Self {
            topic: topic.into(),
            process_definition_key: None,
            worker_id: worker_id.into(),
            limit,
        }
    }

    pub fn with_process_definition_key(mut self, key: impl Into<String>) -> Self {
        self.process_definition_key = Some(key.into());
        self
    }
}

/// Store for process instances
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    /// Insert an ACTIVE process
    async fn run_process(&self, process: Process) -> Result<Process, StoreError>;

    /// Compare-and-set the process state
    async fn change_state(
        &self,
        id: Uuid,
        expected: &[ProcessState],
        to: ProcessState,
    ) -> Result<Process, StoreError>;

    async fn complete_process(&self, id: Uuid) -> Result<Process, StoreError> {
        self.change_state(id, &[ProcessState::Active], ProcessState::Completed)
            .await
    }

    async fn cancel_process(&self, id: Uuid) -> Result<Process, StoreError> {
        self.change_state(
            id,
            &[ProcessState::Active, ProcessState::Incident],
            ProcessState::Canceled,
        )
        .await
    }

    async fn terminate_process(&self, id: Uuid) -> Result<Process, StoreError> {
        self.change_state(
            id,
            &[ProcessState::Active, ProcessState::Incident],
            ProcessState::Terminated,
        )
        .await
    }

    async fn incident(&self, id: Uuid) -> Result<Process, StoreError> {
        self.change_state(id, &[ProcessState::Active], ProcessState::Incident)
            .await
    }

    async fn recover(&self, id: Uuid) -> Result<Process, StoreError> {
        self.change_state(id, &[ProcessState::Incident], ProcessState::Active)
            .await
    }

    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<Process, StoreError>;

    /// Point a process at another definition (migration)
    async fn change_definition(
        &self,
        id: Uuid,
        definition: &ProcessDefinition,
    ) -> Result<Process, StoreError>;

    async fn find_process(&self, id: Uuid) -> Result<Process, StoreError>;

    /// Called process started by a call activity execution
    async fn find_by_parent_activity(&self, activity_id: Uuid)
        -> Result<Option<Process>, StoreError>;

    async fn find_by_business_key(&self, business_key: &str) -> Result<Vec<Process>, StoreError>;

    /// Processes whose process-scope variables contain every given pair
    async fn find_by_variables(&self, variables: &Map<String, Value>)
        -> Result<Vec<Process>, StoreError>;

    async fn find_by_business_key_and_variables(
        &self,
        business_key: &str,
        variables: &Map<String, Value>,
    ) -> Result<Vec<Process>, StoreError>;
}

/// Store for variables
///
/// A variable is identified by its process, scope and key; saving the same
/// identity again overwrites it.
#[async_trait]
pub trait VariableStore: Send + Sync + 'static {
    async fn save_variables(&self, variables: Vec<Variable>) -> Result<(), StoreError>;

    /// Overwrite an existing variable
    async fn update_variable(&self, variable: Variable) -> Result<Variable, StoreError>;

    async fn find_in_process(&self, process_id: Uuid) -> Result<Vec<Variable>, StoreError>;

    /// Variables of a process belonging to any scope in the chain
    async fn find_in_scope(
        &self,
        process_id: Uuid,
        scope: &[String],
    ) -> Result<Vec<Variable>, StoreError>;
}

/// Source of entity ids
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> Uuid;
}

/// Time-ordered UUID v7 ids
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Ids;

impl IdGenerator for UuidV7Ids {
    fn next_id(&self) -> Uuid {
        Uuid::now_v7()
    }
}

/// Deterministic ids counting up from 1
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Uuid {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Uuid::from_u128(n as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_id(), Uuid::from_u128(1));
        assert_eq!(ids.next_id(), Uuid::from_u128(2));
    }

    #[test]
    fn test_optional_transition() {
        let lost: Result<(), StoreError> = Err(StoreError::InvalidTransition {
            id: Uuid::nil(),
            from: "COMPLETED".into(),
            to: "TERMINATED".into(),
        });
        assert_eq!(optional_transition(lost), Ok(None));

        let missing: Result<(), StoreError> = Err(StoreError::ProcessNotFound(Uuid::nil()));
        assert!(optional_transition(missing).is_err());
    }
}
