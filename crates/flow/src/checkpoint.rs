//! The serializable snapshot of a suspended flow.
//!
//! A checkpoint is owned exclusively by its flow and replaced wholesale on
//! every transition commit. Execution position is captured as an explicit
//! resume token ([`Continuation`]) plus the recorded session table, never as
//! a literal stack capture: on restart the engine rebuilds in-memory state
//! from the checkpoint and picks up at the recorded suspension point.

use crate::session::SessionState;
use indexmap::IndexMap;
use ledgerflow_messages::{SessionMessage, SessionPayload};
use ledgerflow_types::{FlowError, FlowId, OperationId, PartyId, SessionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a suspended flow is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingFor {
    /// A message on the given session.
    Receive {
        /// Session to receive from.
        session_id: SessionId,
    },
    /// A timer to fire.
    Sleep {
        /// Absolute wake time (duration since the Unix epoch).
        wake_at: Duration,
    },
    /// An asynchronous operation to complete.
    AsyncOperation {
        /// The operation in flight.
        operation_id: OperationId,
    },
}

/// Resume token for a flow's execution position.
///
/// `suspension_id` equals the checkpoint's suspend counter at the time of
/// suspension; it doubles as the deduplication key for replayed side effects
/// of that suspension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    /// Business logic is runnable; nothing is awaited.
    Runnable,
    /// Suspended awaiting an external condition.
    Suspended {
        /// Suspend counter value at suspension.
        suspension_id: u64,
        /// The awaited condition.
        waiting_for: WaitingFor,
    },
    /// Business logic ran to completion.
    Finished,
}

/// Lifecycle position of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    /// Created but not yet initialized.
    Unstarted {
        /// For initiated flows, the message that triggered creation.
        initiating_message: Option<SessionMessage>,
    },
    /// Running or suspended.
    Started {
        /// Resume token.
        continuation: Continuation,
        /// The payload most recently handed to the continuation on resume,
        /// recorded so a crash between resume and next suspension replays
        /// the same delivery.
        last_delivered: Option<(SessionId, SessionPayload)>,
    },
    /// Ran to completion. Terminal.
    Completed,
    /// Parked by a soft shutdown; resumable on restart.
    Paused {
        /// State to restore when the flow is brought back.
        resume: Box<FlowState>,
    },
}

impl FlowState {
    /// Short name for logs and contract-violation errors.
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Unstarted { .. } => "Unstarted",
            FlowState::Started { .. } => "Started",
            FlowState::Completed => "Completed",
            FlowState::Paused { .. } => "Paused",
        }
    }
}

/// Error position of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorState {
    /// No captured errors.
    Clean,
    /// One or more captured errors; the flow makes no forward progress until
    /// the hospital decides a disposition.
    Errored {
        /// Captured errors, in capture order.
        errors: Vec<FlowError>,
        /// Whether error propagation to peers has begun.
        propagating: bool,
        /// How many sessions (in table order) have been informed.
        propagated_index: usize,
    },
}

impl ErrorState {
    /// Whether any errors are captured.
    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }
}

/// Durable snapshot of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The owning flow.
    pub flow_id: FlowId,
    /// Identity this node's flows send as.
    pub local_party: PartyId,
    /// Lifecycle position.
    pub state: FlowState,
    /// Error position.
    pub error_state: ErrorState,
    /// Number of suspensions so far; monotonically increasing across the
    /// flow's lifetime, never reset by retries.
    pub number_of_suspends: u64,
    /// Session table. Iteration order is insertion order, which is also the
    /// drain order for multi-session operations.
    pub sessions: IndexMap<SessionId, SessionState>,
}

impl Checkpoint {
    /// Fresh checkpoint for a flow about to start.
    pub fn new(
        flow_id: FlowId,
        local_party: PartyId,
        initiating_message: Option<SessionMessage>,
    ) -> Self {
        Self {
            flow_id,
            local_party,
            state: FlowState::Unstarted { initiating_message },
            error_state: ErrorState::Clean,
            number_of_suspends: 0,
            sessions: IndexMap::new(),
        }
    }

    /// Whether the flow has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, FlowState::Completed)
    }

    /// Sessions that are open (not closed, peer not known to have failed),
    /// in insertion order.
    pub fn open_sessions(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions
            .values()
            .filter(|s| !s.closed && s.peer_error.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_types::KeyPair;

    fn party(seed: u8) -> PartyId {
        KeyPair::from_seed(&[seed; 32]).party_id()
    }

    #[test]
    fn test_new_checkpoint_is_unstarted_and_clean() {
        let checkpoint = Checkpoint::new(FlowId::from_bytes([1; 16]), party(1), None);
        assert_eq!(checkpoint.state.name(), "Unstarted");
        assert!(!checkpoint.error_state.is_errored());
        assert_eq!(checkpoint.number_of_suspends, 0);
        assert!(!checkpoint.is_terminal());
    }

    #[test]
    fn test_checkpoint_serde_roundtrip() {
        let mut checkpoint = Checkpoint::new(FlowId::from_bytes([2; 16]), party(1), None);
        checkpoint.state = FlowState::Started {
            continuation: Continuation::Suspended {
                suspension_id: 3,
                waiting_for: WaitingFor::Sleep {
                    wake_at: Duration::from_secs(100),
                },
            },
            last_delivered: None,
        };
        checkpoint
            .sessions
            .insert(SessionId(0), SessionState::initiated(SessionId(0), party(2)));

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(checkpoint, back);
    }

    #[test]
    fn test_open_sessions_skips_closed_and_errored_peers() {
        let mut checkpoint = Checkpoint::new(FlowId::from_bytes([3; 16]), party(1), None);
        checkpoint
            .sessions
            .insert(SessionId(0), SessionState::initiated(SessionId(0), party(2)));
        let mut closed = SessionState::initiated(SessionId(1), party(3));
        closed.closed = true;
        checkpoint.sessions.insert(SessionId(1), closed);
        let mut errored = SessionState::initiated(SessionId(2), party(4));
        errored.peer_error = Some(FlowError::business(1, "peer failed"));
        checkpoint.sessions.insert(SessionId(2), errored);

        let open: Vec<_> = checkpoint.open_sessions().map(|s| s.session_id).collect();
        assert_eq!(open, vec![SessionId(0)]);
    }
}
