//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a flow instance.
///
/// Assigned at flow start and stable across checkpoint/restore cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub Uuid);

impl FlowId {
    /// Create a fresh random flow id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a flow id from raw bytes (for deterministic tests).
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flow({})", self.0)
    }
}

/// Session identifier, unique within the initiating flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Get the next session id.
    pub fn next(self) -> Self {
        SessionId(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

/// Identifier of an in-flight asynchronous operation within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op({})", self.0)
    }
}

/// Identity of a network party, derived from its ed25519 public key.
///
/// The notary verifies request signatures against this key, so claiming a
/// party id without the matching private key is useless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId(pub [u8; 32]);

impl PartyId {
    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Party({}..)", &hex::encode(&self.0[..4]))
    }
}

/// Platform protocol version advertised by a peer.
///
/// Gates optional protocol features; notably, wait-time backpressure
/// notifications are only sent to peers that understand them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// First version that understands `WaitTimeUpdate` messages.
    pub const BACKPRESSURE_NOTIFICATIONS: Self = ProtocolVersion(6);

    /// Whether this version understands wait-time backpressure updates.
    pub fn supports_backpressure(&self) -> bool {
        *self >= Self::BACKPRESSURE_NOTIFICATIONS
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
