//! The consumed-state store.
//!
//! Maps every consumed `StateRef` to the single transaction allowed to spend
//! it. Entries are append-only: created on successful commit, never mutated,
//! never deleted. Atomicity over a commit's full input set comes from doing
//! validation and append under one lock on one store; there is no rollback
//! path because nothing is written until the whole set is known to be clean.

use ledgerflow_messages::NotaryError;
use ledgerflow_types::{
    ConsumedStateDetails, ConsumptionType, Hash, PartyId, StateRef, TimeWindow,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Wait-time estimate returned when a provider doesn't model load.
const DEFAULT_ESTIMATED_WAIT: Duration = Duration::from_millis(100);

/// One entry of the consumed-state log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniquenessRecord {
    /// Transaction that consumed the state.
    pub consuming_tx: Hash,
    /// Party that requested the commit.
    pub requester: PartyId,
    /// Notary clock at commit time.
    pub recorded_at: Duration,
}

/// Durable store committing input-state consumption exactly once.
///
/// Implementations must make `commit` atomic across the full input set:
/// either every input is freshly claimed for `tx_hash`, or none are.
pub trait UniquenessProvider: Send + Sync {
    /// Atomically claim `inputs` for `tx_hash`.
    ///
    /// Conflict detection runs over inputs and references; only inputs claim
    /// states. Re-presenting a transaction that already committed the same
    /// set is an idempotent success, covering request retransmission after a
    /// lost response. The time window, if present, is checked against the
    /// caller-provided trusted clock `now`, allowing `tolerance` of drift on
    /// either bound.
    fn commit(
        &self,
        tx_hash: Hash,
        requester: PartyId,
        inputs: &[StateRef],
        references: &[StateRef],
        time_window: Option<TimeWindow>,
        now: Duration,
        tolerance: Duration,
    ) -> Result<(), NotaryError>;

    /// Estimate how long a request arriving now will wait, given `load`
    /// pending ledger states. Must be monotonically nondecreasing in `load`.
    fn estimated_wait_time(&self, load: usize) -> Duration {
        let _ = load;
        DEFAULT_ESTIMATED_WAIT
    }
}

#[derive(Default)]
struct Inner {
    /// StateRef -> committing transaction. Append-only.
    consumed: HashMap<StateRef, UniquenessRecord>,
    /// Transactions that have fully committed, for replay detection of
    /// zero-input (time-window only) transactions.
    committed: HashSet<Hash>,
}

/// In-memory uniqueness provider.
///
/// A single mutex serializes conflicting writes; each `commit` call is one
/// critical section, giving the transactional isolation the contract
/// requires without application-level per-state locking.
pub struct InMemoryUniquenessProvider {
    inner: Mutex<Inner>,
    /// Linear load model for wait estimation.
    wait_per_state: Duration,
}

impl Default for InMemoryUniquenessProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUniquenessProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wait_per_state: Duration::ZERO,
        }
    }

    /// Use a linear wait model: `estimate = load * per_state`.
    pub fn with_wait_per_state(mut self, per_state: Duration) -> Self {
        self.wait_per_state = per_state;
        self
    }

    /// Look up the record for a state reference, if consumed.
    pub fn record_for(&self, state_ref: &StateRef) -> Option<UniquenessRecord> {
        self.inner.lock().consumed.get(state_ref).cloned()
    }

    /// Number of consumed states recorded.
    pub fn consumed_count(&self) -> usize {
        self.inner.lock().consumed.len()
    }
}

impl UniquenessProvider for InMemoryUniquenessProvider {
    fn commit(
        &self,
        tx_hash: Hash,
        requester: PartyId,
        inputs: &[StateRef],
        references: &[StateRef],
        time_window: Option<TimeWindow>,
        now: Duration,
        tolerance: Duration,
    ) -> Result<(), NotaryError> {
        let mut inner = self.inner.lock();

        // Phase 1: find every state already bound to a different transaction.
        let mut conflicts = Vec::new();
        for input in inputs {
            if let Some(record) = inner.consumed.get(input) {
                if record.consuming_tx != tx_hash {
                    conflicts.push(ConsumedStateDetails {
                        state_ref: *input,
                        consuming_tx: record.consuming_tx,
                        usage: ConsumptionType::Input,
                    });
                }
            }
        }
        for reference in references {
            if let Some(record) = inner.consumed.get(reference) {
                if record.consuming_tx != tx_hash {
                    conflicts.push(ConsumedStateDetails {
                        state_ref: *reference,
                        consuming_tx: record.consuming_tx,
                        usage: ConsumptionType::Reference,
                    });
                }
            }
        }

        if !conflicts.is_empty() {
            return Err(NotaryError::Conflict {
                tx_hash,
                consumed: conflicts,
            });
        }

        // Phase 2: replay of an already-committed transaction succeeds
        // without re-checking the time window; the original commit stands
        // and the caller just lost the response.
        if inner.committed.contains(&tx_hash) {
            debug!(%tx_hash, "idempotent replay of committed transaction");
            return Ok(());
        }

        // Phase 3: fresh commit. Check the window against the trusted clock.
        if let Some(window) = time_window {
            if !window.contains(now, tolerance) {
                return Err(NotaryError::TimeWindowInvalid {
                    time_window: window,
                    notary_time: now,
                });
            }
        }

        // Phase 4: append. Still inside the same critical section, so the
        // full set lands or none of it does.
        for input in inputs {
            inner.consumed.insert(
                *input,
                UniquenessRecord {
                    consuming_tx: tx_hash,
                    requester,
                    recorded_at: now,
                },
            );
        }
        inner.committed.insert(tx_hash);

        debug!(%tx_hash, inputs = inputs.len(), "committed input states");
        Ok(())
    }

    fn estimated_wait_time(&self, load: usize) -> Duration {
        if self.wait_per_state.is_zero() {
            DEFAULT_ESTIMATED_WAIT
        } else {
            DEFAULT_ESTIMATED_WAIT + self.wait_per_state * load as u32
        }
    }
}
