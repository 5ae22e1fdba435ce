//! Process instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::ProcessDefinition;

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Active,
    Completed,
    Canceled,
    Terminated,

    /// An error reached the root without a handler
    Incident,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Terminated)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Terminated => write!(f, "TERMINATED"),
            Self::Incident => write!(f, "INCIDENT"),
        }
    }
}

/// Link from a called process back to the call activity that started it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub process_id: Uuid,
    pub activity_id: Uuid,
    pub root_id: Uuid,
}

/// One running instance of a process definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,

    /// Parent process (call activity instances only)
    pub parent_id: Option<Uuid>,

    /// Outermost process of the call hierarchy (call activity instances only)
    pub root_id: Option<Uuid>,

    /// Call activity execution in the parent that awaits this process
    pub parent_activity_id: Option<Uuid>,

    pub business_key: Option<String>,
    pub definition_id: Uuid,
    pub definition_key: String,
    pub state: ProcessState,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Process {
    pub fn new(id: Uuid, definition: &ProcessDefinition) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id: None,
            root_id: None,
            parent_activity_id: None,
            business_key: None,
            definition_id: definition.id,
            definition_key: definition.key.clone(),
            state: ProcessState::Active,
            suspended: false,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn with_business_key(mut self, business_key: Option<String>) -> Self {
        self.business_key = business_key;
        self
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent_id = Some(parent.process_id);
        self.parent_activity_id = Some(parent.activity_id);
        self.root_id = Some(parent.root_id);
        self
    }

    pub fn is_call_activity(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Outermost process id, this process itself at the root
    pub fn root(&self) -> Uuid {
        self.root_id.unwrap_or(self.id)
    }

    pub fn is_active(&self) -> bool {
        self.state == ProcessState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActivityDefinition, ActivityType};

    fn definition() -> ProcessDefinition {
        ProcessDefinition::builder("p")
            .activity(ActivityDefinition::new("start", ActivityType::StartEvent))
            .build()
            .unwrap()
    }

    #[test]
    fn test_root_process() {
        let process = Process::new(Uuid::now_v7(), &definition());
        assert!(!process.is_call_activity());
        assert_eq!(process.root(), process.id);
        assert!(process.is_active());
    }

    #[test]
    fn test_called_process_links_parent() {
        let root = Uuid::now_v7();
        let parent = Uuid::now_v7();
        let activity = Uuid::now_v7();
        let process = Process::new(Uuid::now_v7(), &definition()).with_parent(ParentLink {
            process_id: parent,
            activity_id: activity,
            root_id: root,
        });

        assert!(process.is_call_activity());
        assert_eq!(process.parent_id, Some(parent));
        assert_eq!(process.root(), root);
    }

    #[test]
    fn test_incident_is_not_terminal() {
        assert!(!ProcessState::Incident.is_terminal());
        assert!(ProcessState::Canceled.is_terminal());
    }
}
