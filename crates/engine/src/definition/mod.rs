//! Process definition model: immutable activity graphs

mod activity;
mod builder;
mod process;

pub use activity::{
    ActivityDefinition, ActivityType, CallActivitySpec, CallMapping, ConditionalFlow,
    VariableMapping,
};
pub use builder::ProcessDefinitionBuilder;
pub use process::{ModelError, ProcessDefinition};
