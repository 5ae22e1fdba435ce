//! In-memory implementation of the persistence contracts

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::store::*;
use crate::definition::{ActivityType, ProcessDefinition};
use crate::runtime::{
    ActivityExecution, ActivityState, ExternalLock, Failure, Process, ProcessState, Variable,
};

/// Variable identity: process, scope, key
type VariableKey = (Uuid, String, String);

/// In-memory store implementing every persistence trait
///
/// Each map sits behind its own lock. Compare-and-set transitions and the
/// join predicate run under the activity write lock, which gives them the
/// same atomicity a row lock gives a relational store. When two locks are
/// needed, activities are locked before processes and processes before
/// variables.
///
/// # Example
///
/// ```
/// use procflow_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.process_count(), 0);
/// ```
pub struct InMemoryStore {
    definitions: RwLock<HashMap<Uuid, Arc<ProcessDefinition>>>,
    processes: RwLock<BTreeMap<Uuid, Process>>,
    activities: RwLock<BTreeMap<Uuid, ActivityExecution>>,
    variables: RwLock<HashMap<VariableKey, Variable>>,
    completion_sequence: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            processes: RwLock::new(BTreeMap::new()),
            activities: RwLock::new(BTreeMap::new()),
            variables: RwLock::new(HashMap::new()),
            completion_sequence: AtomicU64::new(0),
        }
    }

    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    pub fn activity_count(&self) -> usize {
        self.activities.read().len()
    }

    /// Clear all runtime data, keeping deployed definitions
    pub fn clear(&self) {
        self.activities.write().clear();
        self.processes.write().clear();
        self.variables.write().clear();
    }

    fn next_sequence(&self) -> u64 {
        self.completion_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a guarded state change to one execution
    fn transition<'a>(
        activities: &'a mut BTreeMap<Uuid, ActivityExecution>,
        id: Uuid,
        allowed: &[ActivityState],
        to: ActivityState,
    ) -> Result<&'a mut ActivityExecution, StoreError> {
        let execution = activities
            .get_mut(&id)
            .ok_or(StoreError::ActivityNotFound(id))?;

        if !allowed.contains(&execution.state) {
            return Err(StoreError::InvalidTransition {
                id,
                from: execution.state.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        execution.state = to;
        execution.updated_at = now;
        if to.is_terminal() {
            execution.ended_at = Some(now);
            execution.lock = None;
        }
        Ok(execution)
    }

    fn insert_scheduled(
        activities: &mut BTreeMap<Uuid, ActivityExecution>,
        executions: Vec<ActivityExecution>,
    ) {
        for mut execution in executions {
            execution.state = ActivityState::Scheduled;
            activities.insert(execution.id, execution);
        }
    }

    fn process_variables_match(
        variables: &HashMap<VariableKey, Variable>,
        process: &Process,
        expected: &Map<String, Value>,
    ) -> bool {
        expected.iter().all(|(key, value)| {
            variables
                .get(&(process.id, process.definition_key.clone(), key.clone()))
                .is_some_and(|v| &v.to_value() == value)
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn save(
        &self,
        definitions: Vec<ProcessDefinition>,
    ) -> Result<Vec<Arc<ProcessDefinition>>, StoreError> {
        let mut stored = self.definitions.write();
        let mut saved = Vec::with_capacity(definitions.len());

        for mut definition in definitions {
            let latest = stored
                .values()
                .filter(|d| d.key == definition.key)
                .map(|d| d.version)
                .max()
                .unwrap_or(0);
            definition.version = latest + 1;

            let definition = Arc::new(definition);
            stored.insert(definition.id, Arc::clone(&definition));
            saved.push(definition);
        }

        Ok(saved)
    }

    async fn find_definition(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, StoreError> {
        self.definitions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(id.to_string()))
    }

    async fn find_by_key_and_version(
        &self,
        key: &str,
        version: u32,
    ) -> Result<Arc<ProcessDefinition>, StoreError> {
        self.definitions
            .read()
            .values()
            .find(|d| d.key == key && d.version == version)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(format!("{key}:{version}")))
    }

    async fn find_latest_by_key(&self, key: &str) -> Result<Arc<ProcessDefinition>, StoreError> {
        self.definitions
            .read()
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| StoreError::DefinitionNotFound(key.to_string()))
    }
}

#[async_trait]
impl ActivityStore for InMemoryStore {
    async fn schedule(&self, mut execution: ActivityExecution) -> Result<ActivityExecution, StoreError> {
        execution.state = ActivityState::Scheduled;
        self.activities
            .write()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn run(
        &self,
        id: Uuid,
        variables: Map<String, Value>,
    ) -> Result<ActivityExecution, StoreError> {
        let mut activities = self.activities.write();
        let execution = Self::transition(
            &mut activities,
            id,
            &[
                ActivityState::Scheduled,
                ActivityState::Active,
                ActivityState::Failed,
            ],
            ActivityState::Active,
        )?;
        execution.variables = variables;
        execution.failure = None;
        execution.lock = None;
        Ok(execution.clone())
    }

    async fn complete(
        &self,
        id: Uuid,
        successors: Vec<ActivityExecution>,
    ) -> Result<ActivityExecution, StoreError> {
        let mut activities = self.activities.write();
        let sequence = self.next_sequence();
        let execution = Self::transition(
            &mut activities,
            id,
            &[ActivityState::Scheduled, ActivityState::Active],
            ActivityState::Completed,
        )?;
        execution.completion_sequence = sequence;
        let completed = execution.clone();

        Self::insert_scheduled(&mut activities, successors);
        Ok(completed)
    }

    async fn fail(&self, id: Uuid, failure: Failure) -> Result<FailureOutcome, StoreError> {
        let mut activities = self.activities.write();
        let execution = Self::transition(
            &mut activities,
            id,
            &[ActivityState::Scheduled, ActivityState::Active],
            ActivityState::Failed,
        )?;
        execution.lock = None;

        let will_retry = failure.retryable && execution.retries > 0;
        execution.failure = Some(failure);
        if will_retry {
            execution.retries -= 1;
            Ok(FailureOutcome::WillRetry(execution.clone()))
        } else {
            Ok(FailureOutcome::Failed(execution.clone()))
        }
    }

    async fn terminate(&self, id: Uuid) -> Result<ActivityExecution, StoreError> {
        let mut activities = self.activities.write();
        Self::transition(
            &mut activities,
            id,
            &[
                ActivityState::Scheduled,
                ActivityState::Active,
                ActivityState::Failed,
            ],
            ActivityState::Terminated,
        )
        .map(|e| e.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<ActivityExecution, StoreError> {
        let mut activities = self.activities.write();
        Self::transition(
            &mut activities,
            id,
            &[
                ActivityState::Scheduled,
                ActivityState::Active,
                ActivityState::Completed,
                ActivityState::Failed,
                ActivityState::Terminated,
            ],
            ActivityState::Deleted,
        )
        .map(|e| e.clone())
    }

    async fn complete_join(
        &self,
        gateway_execution_id: Uuid,
        incoming: &[String],
        successors: Vec<ActivityExecution>,
    ) -> Result<JoinOutcome, StoreError> {
        let mut activities = self.activities.write();

        let gateway = activities
            .get(&gateway_execution_id)
            .cloned()
            .ok_or(StoreError::ActivityNotFound(gateway_execution_id))?;
        if !gateway.state.is_pending() {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let same_process = |e: &&ActivityExecution| e.process_id == gateway.process_id;

        let last_firing = activities
            .values()
            .filter(same_process)
            .filter(|e| {
                e.definition_id == gateway.definition_id && e.state == ActivityState::Completed
            })
            .map(|e| e.completion_sequence)
            .max()
            .unwrap_or(0);

        let ready = incoming.iter().all(|definition_id| {
            activities.values().filter(same_process).any(|e| {
                &e.definition_id == definition_id
                    && e.state == ActivityState::Completed
                    && e.completion_sequence > last_firing
            })
        });

        let other_arrivals: Vec<Uuid> = activities
            .values()
            .filter(same_process)
            .filter(|e| {
                e.definition_id == gateway.definition_id
                    && e.id != gateway.id
                    && e.state.is_pending()
            })
            .map(|e| e.id)
            .collect();

        if ready {
            let sequence = self.next_sequence();
            for id in other_arrivals {
                Self::transition(
                    &mut activities,
                    id,
                    &[ActivityState::Scheduled, ActivityState::Active],
                    ActivityState::Terminated,
                )?;
            }
            let execution = Self::transition(
                &mut activities,
                gateway_execution_id,
                &[ActivityState::Scheduled, ActivityState::Active],
                ActivityState::Completed,
            )?;
            execution.completion_sequence = sequence;
            let completed = execution.clone();

            Self::insert_scheduled(&mut activities, successors);
            return Ok(JoinOutcome::Completed(completed));
        }

        // One waiting execution per round; later arrivals fold into it
        if !other_arrivals.is_empty() {
            Self::transition(
                &mut activities,
                gateway_execution_id,
                &[ActivityState::Scheduled, ActivityState::Active],
                ActivityState::Terminated,
            )?;
        }
        Ok(JoinOutcome::Waiting)
    }

    async fn find_activity(&self, id: Uuid) -> Result<ActivityExecution, StoreError> {
        self.activities
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ActivityNotFound(id))
    }

    async fn find_by_definition_id(
        &self,
        process_id: Uuid,
        definition_id: &str,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| e.process_id == process_id && e.definition_id == definition_id)
            .cloned()
            .collect())
    }

    async fn find_by_process(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| e.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn find_active(
        &self,
        process_id: Uuid,
        definition_ids: Option<&[String]>,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| e.process_id == process_id && e.state.is_pending())
            .filter(|e| definition_ids.map_or(true, |ids| ids.contains(&e.definition_id)))
            .cloned()
            .collect())
    }

    async fn find_failed(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| e.process_id == process_id && e.state == ActivityState::Failed)
            .cloned()
            .collect())
    }

    async fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| {
                e.state == ActivityState::Active
                    && e.lock.as_ref().is_some_and(|lock| lock.is_expired(now))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn is_all_completed(
        &self,
        process_id: Uuid,
        definition_ids: Option<&[String]>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .filter(|e| e.process_id == process_id)
            .filter(|e| definition_ids.map_or(true, |ids| ids.contains(&e.definition_id)))
            .all(|e| e.state.is_settled()))
    }

    async fn is_any_failed(&self, process_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .activities
            .read()
            .values()
            .any(|e| e.process_id == process_id && e.state == ActivityState::Failed))
    }

    async fn poll(
        &self,
        request: &PollRequest,
        locked_until: DateTime<Utc>,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        let now = Utc::now();
        let mut activities = self.activities.write();
        let processes = self.processes.read();

        let claimable: Vec<Uuid> = activities
            .values()
            .filter(|e| {
                e.state == ActivityState::Active
                    && e.activity_type == ActivityType::ServiceTask
                    && e.topic.as_deref() == Some(request.topic.as_str())
                    && e.lock.as_ref().map_or(true, |lock| lock.is_expired(now))
                    && request
                        .process_definition_key
                        .as_ref()
                        .map_or(true, |key| &e.process_definition_key == key)
            })
            .filter(|e| {
                processes
                    .get(&e.process_id)
                    .is_some_and(|p| p.is_active() && !p.suspended)
            })
            .map(|e| e.id)
            .take(request.limit)
            .collect();

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            if let Some(execution) = activities.get_mut(&id) {
                execution.lock = Some(ExternalLock {
                    worker_id: request.worker_id.clone(),
                    locked_until,
                });
                execution.updated_at = now;
                claimed.push(execution.clone());
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl ProcessStore for InMemoryStore {
    async fn run_process(&self, mut process: Process) -> Result<Process, StoreError> {
        process.state = ProcessState::Active;
        self.processes.write().insert(process.id, process.clone());
        Ok(process)
    }

    async fn change_state(
        &self,
        id: Uuid,
        expected: &[ProcessState],
        to: ProcessState,
    ) -> Result<Process, StoreError> {
        let mut processes = self.processes.write();
        let process = processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;

        if !expected.contains(&process.state) {
            return Err(StoreError::InvalidTransition {
                id,
                from: process.state.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        process.state = to;
        process.updated_at = now;
        if to.is_terminal() {
            process.ended_at = Some(now);
        }
        Ok(process.clone())
    }

    async fn set_suspended(&self, id: Uuid, suspended: bool) -> Result<Process, StoreError> {
        let mut processes = self.processes.write();
        let process = processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;
        process.suspended = suspended;
        process.updated_at = Utc::now();
        Ok(process.clone())
    }

    async fn change_definition(
        &self,
        id: Uuid,
        definition: &ProcessDefinition,
    ) -> Result<Process, StoreError> {
        let mut processes = self.processes.write();
        let process = processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;
        process.definition_id = definition.id;
        process.definition_key = definition.key.clone();
        process.updated_at = Utc::now();
        Ok(process.clone())
    }

    async fn find_process(&self, id: Uuid) -> Result<Process, StoreError> {
        self.processes
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(id))
    }

    async fn find_by_parent_activity(
        &self,
        activity_id: Uuid,
    ) -> Result<Option<Process>, StoreError> {
        Ok(self
            .processes
            .read()
            .values()
            .find(|p| p.parent_activity_id == Some(activity_id))
            .cloned())
    }

    async fn find_by_business_key(&self, business_key: &str) -> Result<Vec<Process>, StoreError> {
        Ok(self
            .processes
            .read()
            .values()
            .filter(|p| p.business_key.as_deref() == Some(business_key))
            .cloned()
            .collect())
    }

    async fn find_by_variables(
        &self,
        variables: &Map<String, Value>,
    ) -> Result<Vec<Process>, StoreError> {
        let processes = self.processes.read();
        let stored = self.variables.read();
        Ok(processes
            .values()
            .filter(|p| Self::process_variables_match(&stored, p, variables))
            .cloned()
            .collect())
    }

    async fn find_by_business_key_and_variables(
        &self,
        business_key: &str,
        variables: &Map<String, Value>,
    ) -> Result<Vec<Process>, StoreError> {
        let processes = self.processes.read();
        let stored = self.variables.read();
        Ok(processes
            .values()
            .filter(|p| p.business_key.as_deref() == Some(business_key))
            .filter(|p| Self::process_variables_match(&stored, p, variables))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VariableStore for InMemoryStore {
    async fn save_variables(&self, variables: Vec<Variable>) -> Result<(), StoreError> {
        let mut stored = self.variables.write();
        for variable in variables {
            let key = (
                variable.process_id,
                variable.execution_definition_id.clone(),
                variable.key.clone(),
            );
            stored.insert(key, variable);
        }
        Ok(())
    }

    async fn update_variable(&self, variable: Variable) -> Result<Variable, StoreError> {
        let mut stored = self.variables.write();
        let key = (
            variable.process_id,
            variable.execution_definition_id.clone(),
            variable.key.clone(),
        );
        match stored.get_mut(&key) {
            Some(existing) => {
                *existing = variable.clone();
                Ok(variable)
            }
            None => Err(StoreError::VariableNotFound {
                process_id: variable.process_id,
                key: variable.key,
            }),
        }
    }

    async fn find_in_process(&self, process_id: Uuid) -> Result<Vec<Variable>, StoreError> {
        Ok(self
            .variables
            .read()
            .values()
            .filter(|v| v.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn find_in_scope(
        &self,
        process_id: Uuid,
        scope: &[String],
    ) -> Result<Vec<Variable>, StoreError> {
        Ok(self
            .variables
            .read()
            .values()
            .filter(|v| v.process_id == process_id && scope.contains(&v.execution_definition_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ActivityDefinition;
    use serde_json::json;

    fn definition() -> ProcessDefinition {
        ProcessDefinition::builder("order")
            .activity(ActivityDefinition::new("start", ActivityType::StartEvent))
            .activity(ActivityDefinition::new("fork", ActivityType::ParallelGateway))
            .activity(ActivityDefinition::new("a", ActivityType::Task))
            .activity(ActivityDefinition::new("b", ActivityType::Task))
            .activity(ActivityDefinition::new("join", ActivityType::ParallelGateway))
            .activity(ActivityDefinition::service_task("charge", "payments").with_retries(1))
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "charge")
            .build()
            .unwrap()
    }

    async fn setup() -> (InMemoryStore, Process, ProcessDefinition) {
        let store = InMemoryStore::new();
        let mut definition = definition();
        definition.id = Uuid::now_v7();
        store.save(vec![definition.clone()]).await.unwrap();
        let process = store
            .run_process(Process::new(Uuid::now_v7(), &definition))
            .await
            .unwrap();
        (store, process, definition)
    }

    async fn spawn(
        store: &InMemoryStore,
        process: &Process,
        definition: &ProcessDefinition,
        activity: &str,
    ) -> ActivityExecution {
        let execution = ActivityExecution::new(
            Uuid::now_v7(),
            process,
            definition.activity(activity).unwrap(),
        );
        let execution = store.schedule(execution).await.unwrap();
        store.run(execution.id, Map::new()).await.unwrap()
    }

    #[tokio::test]
    async fn test_definition_versions_increment() {
        let store = InMemoryStore::new();
        let mut first = definition();
        first.id = Uuid::now_v7();
        let mut second = definition();
        second.id = Uuid::now_v7();

        store.save(vec![first]).await.unwrap();
        let saved = store.save(vec![second]).await.unwrap();
        assert_eq!(saved[0].version, 2);

        let latest = store.find_latest_by_key("order").await.unwrap();
        assert_eq!(latest.version, 2);
        assert!(store.find_by_key_and_version("order", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_completion_is_compare_and_set() {
        let (store, process, definition) = setup().await;
        let task = spawn(&store, &process, &definition, "a").await;

        store.terminate(task.id).await.unwrap();
        let before = store.activity_count();
        let successor = ActivityExecution::new(
            Uuid::now_v7(),
            &process,
            definition.activity("join").unwrap(),
        );
        let late = store.complete(task.id, vec![successor]).await;
        assert!(matches!(late, Err(StoreError::InvalidTransition { .. })));
        assert_eq!(store.activity_count(), before);

        let stored = store.find_activity(task.id).await.unwrap();
        assert_eq!(stored.state, ActivityState::Terminated);
    }

    #[tokio::test]
    async fn test_completion_schedules_successors() {
        let (store, process, definition) = setup().await;
        let task = spawn(&store, &process, &definition, "a").await;
        let successor = ActivityExecution::new(
            Uuid::now_v7(),
            &process,
            definition.activity("join").unwrap(),
        );

        let completed = store.complete(task.id, vec![successor.clone()]).await.unwrap();
        assert!(completed.completion_sequence > 0);

        let scheduled = store.find_activity(successor.id).await.unwrap();
        assert_eq!(scheduled.state, ActivityState::Scheduled);
        assert!(!store.is_all_completed(process.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_consumes_retries() {
        let (store, process, definition) = setup().await;
        let task = spawn(&store, &process, &definition, "charge").await;

        let outcome = store
            .fail(task.id, Failure::retryable("timeout"))
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::WillRetry(ref e) if e.retries == 0));

        store.run(task.id, Map::new()).await.unwrap();
        let outcome = store
            .fail(task.id, Failure::retryable("timeout"))
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::Failed(_)));
        assert!(store.is_any_failed(process.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_join_fires_once_per_round() {
        let (store, process, definition) = setup().await;
        let incoming = vec!["a".to_string(), "b".to_string()];

        let a = spawn(&store, &process, &definition, "a").await;
        store.complete(a.id, vec![]).await.unwrap();
        let first = spawn(&store, &process, &definition, "join").await;
        assert_eq!(
            store.complete_join(first.id, &incoming, vec![]).await.unwrap(),
            JoinOutcome::Waiting
        );

        let b = spawn(&store, &process, &definition, "b").await;
        store.complete(b.id, vec![]).await.unwrap();
        let second = spawn(&store, &process, &definition, "join").await;
        assert!(matches!(
            store.complete_join(second.id, &incoming, vec![]).await.unwrap(),
            JoinOutcome::Completed(_)
        ));

        // The waiting arrival was folded into the firing one
        assert_eq!(
            store.complete_join(first.id, &incoming, vec![]).await.unwrap(),
            JoinOutcome::AlreadyJoined
        );

        // A new round needs fresh completions of both branches
        let a2 = spawn(&store, &process, &definition, "a").await;
        store.complete(a2.id, vec![]).await.unwrap();
        let third = spawn(&store, &process, &definition, "join").await;
        assert_eq!(
            store.complete_join(third.id, &incoming, vec![]).await.unwrap(),
            JoinOutcome::Waiting
        );
    }

    #[tokio::test]
    async fn test_simultaneous_join_arrivals() {
        let (store, process, definition) = setup().await;
        let incoming = vec!["a".to_string(), "b".to_string()];

        for id in ["a", "b"] {
            let branch = spawn(&store, &process, &definition, id).await;
            store.complete(branch.id, vec![]).await.unwrap();
        }
        let x = spawn(&store, &process, &definition, "join").await;
        let y = spawn(&store, &process, &definition, "join").await;

        let outcomes = [
            store.complete_join(x.id, &incoming, vec![]).await.unwrap(),
            store.complete_join(y.id, &incoming, vec![]).await.unwrap(),
        ];
        let fired = outcomes
            .iter()
            .filter(|o| matches!(o, JoinOutcome::Completed(_)))
            .count();
        assert_eq!(fired, 1);
        assert!(store.is_all_completed(process.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_never_double_delivers() {
        let (store, process, definition) = setup().await;
        spawn(&store, &process, &definition, "charge").await;
        let until = Utc::now() + chrono::Duration::seconds(60);

        let first = store
            .poll(&PollRequest::new("payments", "w1", 10), until)
            .await
            .unwrap();
        let second = store
            .poll(&PollRequest::new("payments", "w2", 10), until)
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].lock.as_ref().unwrap().worker_id, "w1");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_poll_skips_suspended_and_reclaims_expired() {
        let (store, process, definition) = setup().await;
        spawn(&store, &process, &definition, "charge").await;

        store.set_suspended(process.id, true).await.unwrap();
        let request = PollRequest::new("payments", "w1", 10);
        assert!(store.poll(&request, Utc::now()).await.unwrap().is_empty());

        store.set_suspended(process.id, false).await.unwrap();
        let expired = Utc::now() - chrono::Duration::seconds(1);
        assert_eq!(store.poll(&request, expired).await.unwrap().len(), 1);
        assert_eq!(store.find_timed_out(Utc::now(), 10).await.unwrap().len(), 1);
        assert_eq!(store.poll(&request, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_blocks_completion() {
        let (store, process, definition) = setup().await;
        let task = spawn(&store, &process, &definition, "a").await;
        store
            .fail(task.id, Failure::non_retryable("boom"))
            .await
            .unwrap();
        assert!(!store.is_all_completed(process.id, None).await.unwrap());

        store.terminate(task.id).await.unwrap();
        assert!(store.is_all_completed(process.id, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_variables_upsert_and_lookup() {
        let (store, process, _) = setup().await;
        let variable = |value: Value| Variable::new("status", &value, process.id, process.id, "order");

        store.save_variables(vec![variable(json!("new"))]).await.unwrap();
        store.save_variables(vec![variable(json!("paid"))]).await.unwrap();
        assert_eq!(store.find_in_process(process.id).await.unwrap().len(), 1);

        let found = store
            .find_by_variables(json!({"status": "paid"}).as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let missing = Variable::new("other", &json!(1), process.id, process.id, "order");
        assert!(matches!(
            store.update_variable(missing).await,
            Err(StoreError::VariableNotFound { .. })
        ));
    }
}
