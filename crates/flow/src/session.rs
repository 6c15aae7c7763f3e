//! Per-peer session channels owned by a checkpoint.

use ledgerflow_types::{FlowError, PartyId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use ledgerflow_messages::SessionPayload;

/// One peer-to-peer channel belonging to a flow.
///
/// Delivery within a session is FIFO in both directions. Sequence counters
/// provide the deduplication keys that make crash-replay of queued sends
/// harmless: a receiver drops anything below its next expected inbound
/// sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Counterparty identity.
    pub peer: PartyId,
    /// Session identifier.
    pub session_id: SessionId,
    /// Whether this side opened the session.
    pub initiated_by_us: bool,
    /// Payloads queued for sending, drained after the owning checkpoint is
    /// persisted.
    pub send_queue: VecDeque<SessionPayload>,
    /// Payloads received and not yet consumed by the flow.
    pub received: VecDeque<SessionPayload>,
    /// Error the peer propagated to us, if any.
    pub peer_error: Option<FlowError>,
    /// Whether the session has been closed (End seen or sent).
    pub closed: bool,
    /// Sequence number the next outbound message will carry.
    pub next_outbound_sequence: u64,
    /// Sequence number expected on the next inbound message.
    pub next_inbound_sequence: u64,
}

impl SessionState {
    /// Session opened by the local flow towards `peer`.
    pub fn initiated(session_id: SessionId, peer: PartyId) -> Self {
        Self {
            peer,
            session_id,
            initiated_by_us: true,
            send_queue: VecDeque::new(),
            received: VecDeque::new(),
            peer_error: None,
            closed: false,
            next_outbound_sequence: 0,
            next_inbound_sequence: 0,
        }
    }

    /// Session opened by a counterparty's first message.
    pub fn initiated_by_peer(session_id: SessionId, peer: PartyId) -> Self {
        Self {
            initiated_by_us: false,
            ..Self::initiated(session_id, peer)
        }
    }

    /// Whether an outbound message on this session would be its first.
    pub fn is_unopened(&self) -> bool {
        self.initiated_by_us && self.next_outbound_sequence == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_types::KeyPair;

    #[test]
    fn test_initiated_session_starts_unopened() {
        let peer = KeyPair::from_seed(&[2; 32]).party_id();
        let session = SessionState::initiated(SessionId(0), peer);
        assert!(session.is_unopened());
        assert!(!session.closed);

        let inbound = SessionState::initiated_by_peer(SessionId(1), peer);
        assert!(!inbound.is_unopened());
    }
}
