//! Runtime records: processes, activity executions and variables

mod activity;
mod process;
pub mod variable;

pub use activity::{ActivityExecution, ActivityState, ExternalLock, Failure};
pub use process::{ParentLink, Process, ProcessState};
pub use variable::{Variable, VariableType};
