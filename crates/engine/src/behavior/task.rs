//! Task behaviors

use async_trait::async_trait;
use tracing::debug;

use super::{Cancellable, Completable, Failable, Invocation, RunOutcome, Runnable};
use crate::engine::EngineError;

/// Plain task: no external work, completes as soon as it runs
pub struct ImmediateTask;

#[async_trait]
impl Runnable for ImmediateTask {
    async fn run(&self, _invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        Ok(RunOutcome::Complete)
    }
}

impl Completable for ImmediateTask {}
impl Cancellable for ImmediateTask {}
impl Failable for ImmediateTask {}

/// Service and user tasks: wait for an external completion
///
/// Service tasks are handed out through `poll` by topic.
pub struct WaitingTask;

#[async_trait]
impl Runnable for WaitingTask {
    async fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome, EngineError> {
        debug!(
            activity_id = %invocation.execution.id,
            definition_id = %invocation.activity.id,
            topic = invocation.activity.topic.as_deref().unwrap_or(""),
            "Waiting for external completion"
        );
        Ok(RunOutcome::Wait)
    }
}

impl Completable for WaitingTask {}
impl Cancellable for WaitingTask {}
impl Failable for WaitingTask {}
