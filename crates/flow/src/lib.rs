//! Durable state-machine engine for long-running peer-to-peer workflows.
//!
//! A flow is a checkpointable workflow exchanging session messages with
//! counterparties. The engine is split the same way the notary is:
//!
//! - [`Checkpoint`] and friends: the serializable snapshot of a suspended
//!   flow (resume token, session table, error state).
//! - [`TransitionEngine`]: a pure function from (state, event) to (new state,
//!   ordered actions). No I/O, no async, fully deterministic.
//! - [`FlowStateMachine`]: the per-flow `StateMachine` impl wrapping the
//!   engine, suitable for driving from a runner.
//! - [`FlowHospital`]: triage for errored flows: retry, park, or terminate.
//!
//! The one ordering rule everything else hangs off: a checkpoint is persisted
//! before any externally observable action derived from the same transition.
//! Crash recovery replays sends from the persisted queues; receivers
//! deduplicate by per-session sequence number, so delivery is at-least-once
//! with exactly-once effect.

mod checkpoint;
mod hospital;
mod machine;
mod session;
mod transition;

pub use checkpoint::{Checkpoint, Continuation, ErrorState, FlowState, WaitingFor};
pub use hospital::{
    Diagnosis, DuplicateInsertStaff, FlowHospital, HospitalConfig, Staff, TransientConnectionStaff,
};
pub use machine::{FlowStateMachine, StateMachineState};
pub use session::SessionState;
pub use transition::{
    CheckpointBarrier, FlowAction, FlowEvent, RemovalReason, SessionUpdate, Transition,
    TransitionEngine, TransitionError,
};
