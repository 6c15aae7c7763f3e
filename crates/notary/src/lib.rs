//! Deterministic notary service: double-spend prevention for a permissioned
//! ledger.
//!
//! Two layers:
//!
//! - [`UniquenessProvider`]: the durable consumed-state store. `commit` is
//!   atomic over a transaction's full input set; a state reference belongs to
//!   at most one transaction for its lifetime.
//! - [`NotaryProtocol`]: the per-request commit state machine. Validates
//!   signatures, notary identity, parameters and size ceilings, emits
//!   backpressure notifications under load, round-trips contract validation
//!   and response signing through the runner, and turns provider results into
//!   wire responses.
//!
//! The protocol follows the synchronous state machine contract from
//! `ledgerflow-core`: it performs no I/O itself and returns ordered action
//! lists for the runner to execute.

mod config;
mod protocol;
mod uniqueness;

pub use config::NotaryConfig;
pub use protocol::{NotaryAction, NotaryEvent, NotaryProtocol};
pub use uniqueness::{InMemoryUniquenessProvider, UniquenessProvider, UniquenessRecord};
