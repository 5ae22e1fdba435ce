//! # Process Orchestration Engine
//!
//! Drives BPMN-style process definitions to completion.
//!
//! ## Features
//!
//! - **Process graphs**: tasks, gateways, events, sub-processes and call activities
//! - **Gateway semantics**: exclusive and inclusive splits, exactly-once parallel joins
//! - **Correlation**: errors, escalations, messages and conditions routed to their handlers,
//!   across call-activity hierarchies
//! - **Incidents**: unhandled errors end in one incident on the root process
//! - **External tasks**: topic-based polling with locks, retries and a timeout sweep
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  (facade: deploy, start, complete, correlate, migrate)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Command
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Dispatcher + worker pool                    │
//! │  (one queue, semaphore-bounded, fire-and-forget or reply)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        EngineCore lifecycle services + behaviors             │
//! │  (process / activity / correlation, per-type behaviors)     │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │ EngineEvent
//!            ▼                                   ▼
//! ┌──────────────────────────┐      ┌───────────────────────────┐
//! │  Stores (InMemoryStore)  │      │  EventBus + listeners     │
//! └──────────────────────────┘      └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use procflow_engine::prelude::*;
//!
//! let engine = Engine::builder().build()?;
//!
//! let definition = ProcessDefinition::builder("order")
//!     .activity(ActivityDefinition::new("start", ActivityType::StartEvent))
//!     .activity(ActivityDefinition::service_task("charge", "payments"))
//!     .activity(ActivityDefinition::new("end", ActivityType::EndEvent))
//!     .flow("start", "charge")
//!     .flow("charge", "end")
//!     .build()?;
//! engine.deploy(definition).await?;
//!
//! let process = engine
//!     .start_process(StartRequest::by_key("order").with_business_key("order-42"))
//!     .await?;
//! engine.wait_idle().await;
//!
//! let tasks = engine
//!     .poll_external_tasks(&PollRequest::new("payments", "worker-1", 10))
//!     .await?;
//! engine.complete_activity(tasks[0].id, Map::new()).await?;
//! ```

pub mod behavior;
pub mod config;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod expression;
pub mod metrics;
pub mod persistence;
pub mod runtime;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::definition::{
        ActivityDefinition, ActivityType, CallActivitySpec, CallMapping, ModelError,
        ProcessDefinition,
    };
    pub use crate::dispatch::{CommandOutcome, EngineEvent, EventListener, StartRequest};
    pub use crate::engine::{
        CorrelationError, Engine, EngineBuilder, EngineError, MessageCorrelation, MigrationPlan,
    };
    pub use crate::persistence::{InMemoryStore, PollRequest, StoreError};
    pub use crate::runtime::{ActivityExecution, ActivityState, Failure, Process, ProcessState};
    pub use crate::worker::{ExternalTaskWorker, ExternalWorkerConfig};
    pub use serde_json::{json, Map, Value};
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use definition::{ActivityDefinition, ActivityType, ModelError, ProcessDefinition};
pub use dispatch::{Command, CommandOutcome, EngineEvent, EventListener, StartRequest};
pub use engine::{
    CorrelationError, Engine, EngineBuilder, EngineError, MessageCorrelation, MigrationError,
    MigrationPlan, MigrationReport,
};
pub use expression::{ExpressionError, ExpressionEvaluator, MiniJinjaEvaluator};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, ProcessMetric};
pub use persistence::{InMemoryStore, PollRequest, StoreError};
pub use runtime::{ActivityExecution, ActivityState, Failure, Process, ProcessState, Variable};
pub use worker::{ExternalTaskWorker, ExternalWorkerConfig, PollerConfig};
