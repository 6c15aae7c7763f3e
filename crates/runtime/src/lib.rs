//! Async runners around the pure state machines.
//!
//! Everything nondeterministic lives here: tokio tasks, timers, storage,
//! network sends, and the collaborator round trips the protocol machines
//! queue as actions. The state machines themselves stay synchronous and
//! deterministic; this crate feeds them events, executes their actions in
//! order, and owns the wall clock.

mod collaborators;
mod executor;
mod notary_runner;
mod storage;

pub use collaborators::{
    AcceptAllValidator, InMemorySessionSender, LocalSigningService, NoopOperationRunner,
    OperationRunner, SessionSender, SigningService, TransactionValidator,
};
pub use executor::{Clock, FlowExecutor, FlowLogic, FlowYield};
pub use notary_runner::NotaryRunner;
pub use storage::{CheckpointStore, InMemoryCheckpointStore, StorageError};
