//! References to consumable ledger states.

use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to one output of one transaction, the unit of consumption.
///
/// Addresses at most one ledger position; the uniqueness provider maps each
/// `StateRef` to the single transaction allowed to consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    /// Transaction that produced the state.
    pub txhash: Hash,
    /// Output index within that transaction.
    pub index: u32,
}

impl StateRef {
    /// Create a new state reference.
    pub fn new(txhash: Hash, index: u32) -> Self {
        Self { txhash, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.txhash, self.index)
    }
}

/// How a transaction uses a state: consuming it or merely reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumptionType {
    /// The state is spent by the transaction.
    Input,
    /// The state is read but not spent.
    Reference,
}

/// Detail of a double-spend conflict: which state, who owns it, and how the
/// rejected transaction tried to use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedStateDetails {
    /// The contested state.
    pub state_ref: StateRef,
    /// Transaction that already consumed it.
    pub consuming_tx: Hash,
    /// Whether the rejected transaction used it as an input or a reference.
    pub usage: ConsumptionType,
}
