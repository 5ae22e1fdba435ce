//! Engine error types

use uuid::Uuid;

use crate::definition::{ActivityType, ModelError};
use crate::expression::ExpressionError;
use crate::persistence::StoreError;
use crate::runtime::{Failure, ProcessState};

/// Errors reported to callers of `correlate_message`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("message {message} needs a business key or correlation variables")]
    MissingCriteria { message: String },

    #[error("no processes correlated for message {message}")]
    NoProcessCorrelated { message: String },

    #[error("multiple processes correlated for message {message}: {count}")]
    MultipleProcessesCorrelated { message: String, count: usize },

    #[error("invalid process state {state} of {process_id} for message {message}")]
    InvalidProcessState {
        message: String,
        process_id: Uuid,
        state: ProcessState,
    },
}

/// Administrative errors raised by migration
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("process {process_id} runs {found}, cannot migrate to {expected}")]
    KeyMismatch {
        process_id: Uuid,
        expected: String,
        found: String,
    },

    #[error("process {process_id} is {state}")]
    InvalidProcessState { process_id: Uuid, state: ProcessState },

    #[error("activity {activity_id} of process {process_id} has no target in the new definition")]
    UnmappedActivity { process_id: Uuid, activity_id: String },

    /// A failure after validation; `migrated` processes were already moved
    #[error("migration aborted after {migrated} of {total} processes: {source}")]
    Aborted {
        migrated: usize,
        total: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Umbrella error of the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("{activity_type} does not support {capability}")]
    Unsupported {
        capability: &'static str,
        activity_type: ActivityType,
    },

    #[error("process {0} is suspended")]
    ProcessSuspended(Uuid),

    /// Work of an activity failed
    #[error("activity failed: {0}")]
    Failure(Failure),

    #[error("engine is shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error is an execution failure that moves the activity to FAILED
    ///
    /// Gateways that cannot pick a path fail like any other activity. Other
    /// modeling errors and persistence errors abort the command instead.
    pub fn routes_to_fail(&self) -> bool {
        matches!(
            self,
            Self::Expression(_)
                | Self::Failure(_)
                | Self::Model(
                    ModelError::NoExclusivePath { .. }
                        | ModelError::MultipleExclusivePaths { .. }
                        | ModelError::EmptyInclusiveResult { .. }
                )
        )
    }

    pub(crate) fn unsupported(capability: &'static str, activity_type: ActivityType) -> Self {
        Self::Unsupported {
            capability,
            activity_type,
        }
    }

    /// Failure recorded on the activity when this error routes to fail
    pub fn to_failure(&self) -> Failure {
        match self {
            Self::Failure(failure) => failure.clone(),
            other => Failure::non_retryable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_to_fail() {
        let expression = EngineError::Expression(ExpressionError::Evaluation {
            expression: "${x >}".into(),
            message: "unexpected end".into(),
        });
        assert!(expression.routes_to_fail());
        assert!(!expression.to_failure().retryable);

        let no_path = EngineError::Model(ModelError::NoExclusivePath {
            gateway: "gw".into(),
        });
        assert!(no_path.routes_to_fail());
        assert!(no_path.to_failure().message.contains("gw"));

        let unknown = EngineError::Model(ModelError::ActivityNotFound {
            key: "order".into(),
            activity_id: "ghost".into(),
        });
        assert!(!unknown.routes_to_fail());

        let failure = EngineError::Failure(Failure::retryable("boom").with_code("E1"));
        assert_eq!(failure.to_failure().error_code.as_deref(), Some("E1"));
    }

    #[test]
    fn test_correlation_messages() {
        let err = CorrelationError::NoProcessCorrelated {
            message: "paid".into(),
        };
        assert_eq!(err.to_string(), "no processes correlated for message paid");
    }
}
