//! Moving running processes onto another definition version

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{EngineCore, EngineError, MigrationError};
use crate::definition::ProcessDefinition;
use crate::persistence::FailureOutcome;
use crate::runtime::{ActivityExecution, ActivityState, Process};

/// Processes to move and how their activities map onto the target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub process_ids: Vec<Uuid>,
    pub target_definition_id: Uuid,

    /// Source activity id to target activity id; unmapped ids keep their name
    #[serde(default)]
    pub activity_mapping: HashMap<String, String>,
}

impl MigrationPlan {
    pub fn new(process_ids: Vec<Uuid>, target_definition_id: Uuid) -> Self {
        Self {
            process_ids,
            target_definition_id,
            activity_mapping: HashMap::new(),
        }
    }

    pub fn with_mapping(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.activity_mapping.insert(source.into(), target.into());
        self
    }

    fn target_of<'a>(&'a self, source: &'a str) -> &'a str {
        self.activity_mapping
            .get(source)
            .map(String::as_str)
            .unwrap_or(source)
    }
}

/// Result of a completed migration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migrated: usize,

    /// Executions recreated against the target definition
    pub activities: usize,
}

/// A validated process with the executions to move
struct Move {
    process: Process,
    open: Vec<ActivityExecution>,
}

impl EngineCore {
    /// Validate every process, then move them one by one
    #[instrument(skip(self, plan), fields(target = %plan.target_definition_id, count = plan.process_ids.len()))]
    pub(crate) async fn migrate(
        &self,
        plan: &MigrationPlan,
    ) -> Result<MigrationReport, MigrationError> {
        let target = self
            .definitions
            .find_definition(plan.target_definition_id)
            .await?;

        let mut moves = Vec::with_capacity(plan.process_ids.len());
        for process_id in &plan.process_ids {
            moves.push(self.validate_move(plan, &target, *process_id).await?);
        }

        let total = moves.len();
        let mut report = MigrationReport::default();
        for pending in moves {
            let process_id = pending.process.id;
            match self.apply_move(plan, &target, pending).await {
                Ok(activities) => {
                    report.migrated += 1;
                    report.activities += activities;
                }
                Err(e) => {
                    warn!(%process_id, error = %e, "Migration aborted");
                    return Err(MigrationError::Aborted {
                        migrated: report.migrated,
                        total,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            migrated = report.migrated,
            activities = report.activities,
            version = target.version,
            "Processes migrated"
        );
        Ok(report)
    }

    async fn validate_move(
        &self,
        plan: &MigrationPlan,
        target: &ProcessDefinition,
        process_id: Uuid,
    ) -> Result<Move, MigrationError> {
        let process = self.processes.find_process(process_id).await?;
        if process.definition_key != target.key {
            return Err(MigrationError::KeyMismatch {
                process_id,
                expected: target.key.clone(),
                found: process.definition_key,
            });
        }
        if process.state.is_terminal() {
            return Err(MigrationError::InvalidProcessState {
                process_id,
                state: process.state,
            });
        }

        let open: Vec<_> = self
            .activities
            .find_by_process(process_id)
            .await?
            .into_iter()
            .filter(|e| !e.is_in_terminal_state())
            .collect();
        if let Some(unmapped) = open
            .iter()
            .find(|e| target.activity(plan.target_of(&e.definition_id)).is_none())
        {
            return Err(MigrationError::UnmappedActivity {
                process_id,
                activity_id: unmapped.definition_id.clone(),
            });
        }

        Ok(Move { process, open })
    }

    /// Replace the open executions of one process, returning how many moved
    async fn apply_move(
        &self,
        plan: &MigrationPlan,
        target: &Arc<ProcessDefinition>,
        pending: Move,
    ) -> Result<usize, EngineError> {
        let Move { process, open } = pending;
        let moved = Process {
            definition_id: target.id,
            definition_key: target.key.clone(),
            ..process.clone()
        };

        for old in &open {
            self.activities.delete(old.id).await?;

            let definition = target.require(plan.target_of(&old.definition_id))?;
            let mut recreated = ActivityExecution::new(self.ids.next_id(), &moved, definition);
            recreated.retries = if old.state == ActivityState::Failed {
                0
            } else {
                old.retries
            };
            let recreated = self.activities.schedule(recreated).await?;

            match old.state {
                ActivityState::Active => {
                    self.activities
                        .run(recreated.id, old.variables.clone())
                        .await?;
                }
                ActivityState::Failed => {
                    self.activities
                        .run(recreated.id, old.variables.clone())
                        .await?;
                    if let Some(failure) = old.failure.clone() {
                        if let FailureOutcome::WillRetry(_) =
                            self.activities.fail(recreated.id, failure).await?
                        {
                            warn!(execution_id = %recreated.id, "Migrated failure kept a retry");
                        }
                    }
                }
                _ => {}
            }
        }

        self.processes.change_definition(process.id, target).await?;
        Ok(open.len())
    }
}
