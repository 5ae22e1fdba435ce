//! Events: facts published after a transition is persisted

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::ActivityExecution;

/// Engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessStarted {
        process_id: Uuid,
        definition_key: String,
    },
    ProcessCompleted {
        process_id: Uuid,
        definition_key: String,
    },
    ProcessCanceled {
        process_id: Uuid,
        definition_key: String,
    },
    ProcessTerminated {
        process_id: Uuid,
        definition_key: String,
    },
    ProcessIncident {
        process_id: Uuid,
        definition_key: String,
        reason: String,
    },
    ProcessRecovered {
        process_id: Uuid,
        definition_key: String,
    },
    ActivityCompleted {
        execution: ActivityExecution,
    },
    ActivityFailed {
        execution: ActivityExecution,
    },
    VariablesSet {
        process_id: Uuid,
        scopes: Vec<String>,
    },
}

impl EngineEvent {
    /// Dotted event type used for listener filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "process.started",
            Self::ProcessCompleted { .. } => "process.completed",
            Self::ProcessCanceled { .. } => "process.canceled",
            Self::ProcessTerminated { .. } => "process.terminated",
            Self::ProcessIncident { .. } => "process.incident",
            Self::ProcessRecovered { .. } => "process.recovered",
            Self::ActivityCompleted { .. } => "activity.completed",
            Self::ActivityFailed { .. } => "activity.failed",
            Self::VariablesSet { .. } => "variables.set",
        }
    }

    pub fn process_id(&self) -> Uuid {
        match self {
            Self::ProcessStarted { process_id, .. }
            | Self::ProcessCompleted { process_id, .. }
            | Self::ProcessCanceled { process_id, .. }
            | Self::ProcessTerminated { process_id, .. }
            | Self::ProcessIncident { process_id, .. }
            | Self::ProcessRecovered { process_id, .. }
            | Self::VariablesSet { process_id, .. } => *process_id,
            Self::ActivityCompleted { execution } | Self::ActivityFailed { execution } => {
                execution.process_id
            }
        }
    }
}
