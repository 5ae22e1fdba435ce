//! Per-type activity behaviors
//!
//! Every activity type maps to one [`Behavior`]: a mandatory [`Runnable`]
//! plus whichever of [`Completable`], [`Cancellable`], [`Failable`] and
//! [`Triggerable`] the type supports. The lifecycle services in
//! [`crate::engine`] drive state transitions; behaviors decide what a
//! transition means for their type.
//!
//! ```text
//!   run ──► Wait ──(signal)──► complete ──► Advance(successors)
//!    │                              │       EndOfPath (scope check)
//!    └──► Complete ─────────────────┘       Halt
//! ```

mod container;
mod event;
mod gateway;
mod resolver;
mod task;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::definition::{ActivityDefinition, ProcessDefinition};
use crate::dispatch::{Command, CommandOutcome};
use crate::engine::{EngineCore, EngineError};
use crate::persistence::optional_transition;
use crate::runtime::{ActivityExecution, Failure, Process};

pub(crate) use container::map_call;
pub use resolver::{Behavior, BehaviorBuilder, BehaviorResolver};

/// One behavior call against a persisted execution
pub struct Invocation<'a> {
    pub core: &'a EngineCore,
    pub process: &'a Process,
    pub definition: &'a Arc<ProcessDefinition>,
    pub activity: &'a ActivityDefinition,
    pub execution: &'a ActivityExecution,
}

impl<'a> Invocation<'a> {
    /// Variables visible from this activity, nearest scope first
    pub async fn visible_variables(&self) -> Result<Map<String, Value>, EngineError> {
        let scope = self.definition.scope(&self.activity.id)?;
        self.core.visible_variables(self.process.id, &scope).await
    }

    /// Schedule one execution per target definition (not yet persisted)
    pub fn successors(&self, targets: &[String]) -> Result<Vec<ActivityExecution>, EngineError> {
        self.core
            .new_executions(self.process, self.definition, targets)
    }

    fn dispatch(&self, command: Command) {
        self.core.dispatcher.dispatch(command);
    }
}

/// Off-flow activation of an activity definition
pub struct Trigger<'a> {
    pub core: &'a EngineCore,
    pub process: &'a Process,
    pub definition: &'a Arc<ProcessDefinition>,
    pub activity: &'a ActivityDefinition,
}

/// What running an activity led to
#[derive(Debug)]
pub enum RunOutcome {
    /// Waits for an external signal
    Wait,

    /// Completes right away through its completable
    Complete,

    /// The behavior already persisted the completion
    Completed(Completion),
}

/// How the flow continues after a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Run these scheduled successor executions
    Advance(Vec<Uuid>),

    /// The path ended; check whether the enclosing scope is done
    EndOfPath,

    /// Nothing follows
    Halt,
}

/// A persisted completion and its continuation
#[derive(Debug)]
pub struct Completion {
    pub execution: ActivityExecution,
    pub continuation: Continuation,
}

impl Completion {
    /// Continue with `successors`, or end the path when there are none
    pub fn along(execution: ActivityExecution, successors: Vec<Uuid>) -> Self {
        let continuation = if successors.is_empty() {
            Continuation::EndOfPath
        } else {
            Continuation::Advance(successors)
        };
        Self {
            execution,
            continuation,
        }
    }

    pub fn halt(execution: ActivityExecution) -> Self {
        Self {
            execution,
            continuation: Continuation::Halt,
        }
    }
}

#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError>;
}

#[async_trait]
pub trait Completable: Send + Sync {
    /// Definitions the flow continues with
    async fn next(
        &self,
        invocation: &Invocation<'_>,
        _variables: &Map<String, Value>,
    ) -> Result<Vec<String>, EngineError> {
        Ok(invocation.activity.outgoing.clone())
    }

    /// Persist the completion; `None` when another signal won the transition
    async fn complete(
        &self,
        invocation: &Invocation<'_>,
        variables: &Map<String, Value>,
    ) -> Result<Option<Completion>, EngineError> {
        let targets = self.next(invocation, variables).await?;
        complete_along(invocation, &targets).await
    }
}

/// Complete an execution and schedule `targets` in the same transition
pub(crate) async fn complete_along(
    invocation: &Invocation<'_>,
    targets: &[String],
) -> Result<Option<Completion>, EngineError> {
    let successors = invocation.successors(targets)?;
    let ids: Vec<Uuid> = successors.iter().map(|s| s.id).collect();

    let completed = optional_transition(
        invocation
            .core
            .activities
            .complete(invocation.execution.id, successors)
            .await,
    )?;
    Ok(completed.map(|execution| Completion::along(execution, ids)))
}

#[async_trait]
pub trait Cancellable: Send + Sync {
    /// Move the execution to TERMINATED; `propagate` reaches nested work
    ///
    /// Returns `None` when the execution was already settled.
    async fn terminate(
        &self,
        invocation: &Invocation<'_>,
        _propagate: bool,
    ) -> Result<Option<ActivityExecution>, EngineError> {
        Ok(optional_transition(
            invocation
                .core
                .activities
                .terminate(invocation.execution.id)
                .await,
        )?)
    }

    async fn cancel(
        &self,
        invocation: &Invocation<'_>,
    ) -> Result<Option<ActivityExecution>, EngineError> {
        self.terminate(invocation, true).await
    }
}

#[async_trait]
pub trait Failable: Send + Sync {
    /// Called once the execution is persisted FAILED with no retries left
    async fn fail(&self, invocation: &Invocation<'_>, failure: &Failure) -> Result<(), EngineError> {
        invocation.dispatch(Command::IncidentProcess {
            process_id: invocation.process.id,
            reason: format!("{} failed: {failure}", invocation.activity.id),
        });
        Ok(())
    }

    /// Called when a failure consumed a retry
    async fn retry(&self, invocation: &Invocation<'_>) -> Result<(), EngineError> {
        invocation.dispatch(Command::RetryActivity {
            activity_id: invocation.execution.id,
        });
        Ok(())
    }
}

#[async_trait]
pub trait Triggerable: Send + Sync {
    async fn trigger(
        &self,
        trigger: &Trigger<'_>,
        variables: Map<String, Value>,
    ) -> Result<CommandOutcome, EngineError>;
}
