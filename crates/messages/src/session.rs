//! Flow session protocol payloads.

use ledgerflow_types::{FlowError, PartyId, SessionId};
use serde::{Deserialize, Serialize};

/// Envelope for one message on a flow session.
///
/// `sequence` numbers are per-session and strictly increasing, giving the
/// receiver FIFO ordering and a deduplication key for idempotent redelivery
/// after crash-recovery replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Session this message belongs to.
    pub session_id: SessionId,
    /// Sending party.
    pub sender: PartyId,
    /// Per-session sequence number, starting at 0.
    pub sequence: u64,
    /// The payload.
    pub payload: SessionPayload,
}

/// What a session message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPayload {
    /// Application data, opaque to the engine.
    Data(Vec<u8>),
    /// The sending flow failed; this is the error being propagated.
    Error(FlowError),
    /// The sending flow completed and closed the session.
    End,
}

impl SessionPayload {
    /// Get a human-readable name for this payload type.
    pub fn type_name(&self) -> &'static str {
        match self {
            SessionPayload::Data(_) => "Data",
            SessionPayload::Error(_) => "Error",
            SessionPayload::End => "End",
        }
    }

    /// Whether this payload closes the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionPayload::Data(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_types::KeyPair;

    #[test]
    fn test_payload_terminality() {
        assert!(!SessionPayload::Data(vec![1, 2]).is_terminal());
        assert!(SessionPayload::End.is_terminal());
        assert!(SessionPayload::Error(FlowError::business(1, "boom")).is_terminal());
    }

    #[test]
    fn test_session_message_serde_roundtrip() {
        let message = SessionMessage {
            session_id: SessionId(4),
            sender: KeyPair::from_seed(&[3u8; 32]).party_id(),
            sequence: 17,
            payload: SessionPayload::Data(b"hello".to_vec()),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: SessionMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
