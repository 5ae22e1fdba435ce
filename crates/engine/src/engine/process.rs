//! Process lifecycle services

use std::sync::Arc;

use serde_json::Map;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{EngineCore, EngineError};
use crate::behavior::map_call;
use crate::definition::ProcessDefinition;
use crate::dispatch::{run_batch, Command, CommandOutcome, DefinitionRef, EngineEvent, StartRequest};
use crate::persistence::optional_transition;
use crate::runtime::{variable, ActivityState, Failure, Process, ProcessState};

impl EngineCore {
    pub(crate) async fn resolve_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Arc<ProcessDefinition>, EngineError> {
        let definition = match reference {
            DefinitionRef::Id { id } => self.definitions.find_definition(*id).await?,
            DefinitionRef::Key {
                key,
                version: Some(version),
            } => self.definitions.find_by_key_and_version(key, *version).await?,
            DefinitionRef::Key { key, version: None } => {
                self.definitions.find_latest_by_key(key).await?
            }
        };
        Ok(definition)
    }

    /// Create an ACTIVE process and run its start event
    #[instrument(skip(self, request), fields(definition = ?request.definition))]
    pub(crate) async fn start_process(&self, request: StartRequest) -> Result<Process, EngineError> {
        let definition = self.resolve_definition(&request.definition).await?;
        let start_id = definition.start_activity()?.id.clone();

        let mut process =
            Process::new(self.ids.next_id(), &definition).with_business_key(request.business_key);
        if let Some(parent) = request.parent {
            process = process.with_parent(parent);
        }
        let process = self.processes.run_process(process).await?;

        info!(
            process_id = %process.id,
            definition_key = %definition.key,
            version = definition.version,
            parent_id = ?process.parent_id,
            "Process started"
        );
        self.publish(EngineEvent::ProcessStarted {
            process_id: process.id,
            definition_key: process.definition_key.clone(),
        })
        .await;

        self.save_process_variables(&process, request.variables)
            .await?;
        self.run_new(&process, &definition, &start_id).await?;
        Ok(process)
    }

    /// Complete the process once every activity is settled
    #[instrument(skip(self))]
    pub(crate) async fn complete_process(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        let process = self.processes.find_process(id).await?;
        if process.state != ProcessState::Active {
            debug!(state = %process.state, "Process not active, not completing");
            return Ok(CommandOutcome::Skipped);
        }
        if !self.activities.is_all_completed(id, None).await? {
            debug!("Process still has open activities");
            return Ok(CommandOutcome::Skipped);
        }
        let Some(completed) = optional_transition(self.processes.complete_process(id).await)? else {
            return Ok(CommandOutcome::Skipped);
        };

        info!(process_id = %id, definition_key = %completed.definition_key, "Process completed");
        self.publish(EngineEvent::ProcessCompleted {
            process_id: id,
            definition_key: completed.definition_key.clone(),
        })
        .await;

        self.signal_parent(&completed).await?;
        Ok(CommandOutcome::Process(completed))
    }

    /// Complete the call activity that started `process`, mapping its outputs
    pub(crate) async fn signal_parent(&self, process: &Process) -> Result<(), EngineError> {
        let Some(parent_activity_id) = process.parent_activity_id else {
            return Ok(());
        };
        let call = self.activities.find_activity(parent_activity_id).await?;
        let parent_definition = self
            .definitions
            .find_definition(call.process_definition_id)
            .await?;
        let call_definition = parent_definition.require(&call.definition_id)?;

        let outputs = match &call_definition.call {
            Some(spec) if !spec.outputs.is_empty() => {
                let found = self.variables.find_in_process(process.id).await?;
                let visible = variable::to_map(&found, &[process.definition_key.clone()]);
                map_call(self.evaluator.as_ref(), &spec.outputs, &visible)?
            }
            _ => Map::new(),
        };

        debug!(parent_activity_id = %parent_activity_id, "Signalling parent call activity");
        self.dispatcher.dispatch(Command::CompleteActivity {
            activity_id: parent_activity_id,
            variables: outputs,
        });
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) async fn cancel_process(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        self.end_process(id, ProcessState::Canceled).await
    }

    #[instrument(skip(self))]
    pub(crate) async fn terminate_process(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        self.end_process(id, ProcessState::Terminated).await
    }

    /// Terminate every open activity, then persist the process transition
    async fn end_process(&self, id: Uuid, to: ProcessState) -> Result<CommandOutcome, EngineError> {
        let process = self.processes.find_process(id).await?;
        if process.state.is_terminal() {
            debug!(state = %process.state, "Process already ended");
            return Ok(CommandOutcome::Skipped);
        }

        let open: Vec<Command> = self
            .open_executions(id, None)
            .await?
            .into_iter()
            .map(|e| Command::TerminateActivity {
                activity_id: e.id,
                propagate: true,
            })
            .collect();
        if !open.is_empty() {
            let report = run_batch(self.handler()?, open).await;
            if !report.is_success() {
                warn!(
                    terminated = report.succeeded,
                    failed = report.failures.len(),
                    "Some activities could not be terminated"
                );
            }
        }

        let ended = match to {
            ProcessState::Canceled => self.processes.cancel_process(id).await,
            _ => self.processes.terminate_process(id).await,
        };
        let Some(ended) = optional_transition(ended)? else {
            return Ok(CommandOutcome::Skipped);
        };

        info!(process_id = %id, state = %ended.state, "Process ended");
        let definition_key = ended.definition_key.clone();
        let event = match to {
            ProcessState::Canceled => EngineEvent::ProcessCanceled {
                process_id: id,
                definition_key,
            },
            _ => EngineEvent::ProcessTerminated {
                process_id: id,
                definition_key,
            },
        };
        self.publish(event).await;
        Ok(CommandOutcome::Process(ended))
    }

    /// Put the process in INCIDENT and fail the call activity that started it
    #[instrument(skip(self))]
    pub(crate) async fn incident_process(
        &self,
        id: Uuid,
        reason: String,
    ) -> Result<CommandOutcome, EngineError> {
        let Some(process) = optional_transition(self.processes.incident(id).await)? else {
            debug!("Process not active, incident not raised");
            return Ok(CommandOutcome::Skipped);
        };

        warn!(process_id = %id, reason = %reason, "Process incident");
        self.publish(EngineEvent::ProcessIncident {
            process_id: id,
            definition_key: process.definition_key.clone(),
            reason: reason.clone(),
        })
        .await;

        if let Some(parent_activity_id) = process.parent_activity_id {
            self.dispatcher.dispatch(Command::FailActivity {
                activity_id: parent_activity_id,
                failure: Failure::non_retryable(format!(
                    "called process {id} raised an incident: {reason}"
                )),
                variables: Map::new(),
            });
        }
        Ok(CommandOutcome::Process(process))
    }

    /// Return an INCIDENT process to ACTIVE once nothing in it is FAILED
    ///
    /// A recovered called process also reopens its failed call activity and
    /// lets the parent recover in turn.
    #[instrument(skip(self))]
    pub(crate) async fn recover_process(&self, id: Uuid) -> Result<CommandOutcome, EngineError> {
        let process = self.processes.find_process(id).await?;
        if process.state != ProcessState::Incident {
            return Ok(CommandOutcome::Skipped);
        }
        if self.activities.is_any_failed(id).await? {
            debug!("Process still has failed activities");
            return Ok(CommandOutcome::Skipped);
        }
        let Some(recovered) = optional_transition(self.processes.recover(id).await)? else {
            return Ok(CommandOutcome::Skipped);
        };

        info!(process_id = %id, "Process recovered");
        self.publish(EngineEvent::ProcessRecovered {
            process_id: id,
            definition_key: recovered.definition_key.clone(),
        })
        .await;

        // Paths that ended while the incident was open could not complete the process
        self.dispatcher.dispatch(Command::CompleteProcess { process_id: id });

        if let Some(parent_activity_id) = recovered.parent_activity_id {
            let call = self.activities.find_activity(parent_activity_id).await?;
            if call.state == ActivityState::Failed {
                optional_transition(self.activities.run(call.id, call.variables.clone()).await)?;
                self.dispatcher.dispatch(Command::RecoverProcess {
                    process_id: call.process_id,
                });
            }
        }
        Ok(CommandOutcome::Process(recovered))
    }
}
