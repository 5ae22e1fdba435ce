//! Dispatch substrate: commands, events, the worker-pool dispatcher and the event bus

mod bus;
mod command;
mod dispatcher;
mod event;

pub use bus::{EventBus, EventListener};
pub use command::{Command, CommandOutcome, DefinitionRef, StartRequest};
pub use dispatcher::{
    run_batch, BatchReport, CommandHandler, CommandResult, DispatchQueue, Dispatcher,
};
pub use event::EngineEvent;
