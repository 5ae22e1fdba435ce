//! External task workers
//!
//! - [`ExternalTaskWorker`] - polls service tasks by topic and runs handlers
//! - [`ExternalTaskPoller`] - claiming with exponential backoff
//! - [`TimeoutSweeper`] - re-runs tasks whose lock expired
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               ExternalTaskWorker                  │
//! │  ┌────────────────────┐                           │
//! │  │ ExternalTaskPoller │──── Engine::poll_external_tasks
//! │  └─────────┬──────────┘                           │
//! │            ▼                                      │
//! │  ┌────────────────────────────────────────────┐   │
//! │  │   Handlers (Semaphore-limited)             │   │
//! │  │   Ok  -> Engine::complete_activity         │   │
//! │  │   Err -> Engine::fail_activity             │   │
//! │  └────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────┘
//! ```

mod external;
mod poller;
mod sweeper;

pub use external::{
    ExternalTaskWorker, ExternalWorkerConfig, TaskHandler, TaskResult, WorkerError, WorkerStatus,
};
pub use poller::{ExternalTaskPoller, PollerConfig, PollerError};
pub use sweeper::TimeoutSweeper;
