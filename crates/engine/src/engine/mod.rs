//! Lifecycle services and the engine facade
//!
//! [`EngineCore`] owns the stores and routes every [`Command`](crate::dispatch::Command)
//! to a lifecycle service. The services are split by concern:
//!
//! - `process` - start, complete, cancel, terminate, incident and recovery
//! - `activity` - run, complete, fail, terminate and trigger executions
//! - `correlation` - errors, escalations, messages and conditions
//! - `migration` - moving processes between definition versions
//!
//! [`Engine`] is the public entry point built with [`EngineBuilder`].

mod activity;
mod core;
mod correlation;
mod error;
mod listener;
mod migration;
mod process;
mod service;
mod timer;

pub use self::core::EngineCore;
pub use correlation::MessageCorrelation;
pub use error::{CorrelationError, EngineError, MigrationError};
pub use migration::{MigrationPlan, MigrationReport};
pub use service::{Engine, EngineBuilder};
pub use timer::TimerService;
