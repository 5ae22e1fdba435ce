//! Persistence layer
//!
//! This module provides:
//! - Store traits the engine depends on ([`DefinitionStore`], [`ActivityStore`],
//!   [`ProcessStore`], [`VariableStore`]) and the injectable [`IdGenerator`]
//! - [`InMemoryStore`], the reference implementation used by tests

mod memory;
mod store;

pub use memory::InMemoryStore;
pub use store::{
    optional_transition, ActivityStore, DefinitionStore, FailureOutcome, IdGenerator, JoinOutcome,
    PollRequest, ProcessStore, SequentialIds, StoreError, UuidV7Ids, VariableStore,
};
