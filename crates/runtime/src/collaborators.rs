//! Collaborator traits the runners round-trip to, with in-process
//! implementations for tests and single-node deployments.

use async_trait::async_trait;
use ledgerflow_messages::SessionMessage;
use ledgerflow_types::{FlowError, FlowId, Hash, KeyPair, OperationId, PartyId, Signature};
use parking_lot::Mutex;

/// Outbound transport for session messages.
#[async_trait]
pub trait SessionSender: Send + Sync {
    /// Deliver `message` to `peer`. At-least-once is sufficient; receivers
    /// deduplicate by sequence number.
    async fn send(&self, peer: PartyId, message: SessionMessage) -> Result<(), FlowError>;
}

/// Sender that records everything, for assertions and manual ferrying.
#[derive(Default)]
pub struct InMemorySessionSender {
    sent: Mutex<Vec<(PartyId, SessionMessage)>>,
}

impl InMemorySessionSender {
    /// Empty sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<(PartyId, SessionMessage)> {
        self.sent.lock().clone()
    }

    /// Drain the recorded messages.
    pub fn take(&self) -> Vec<(PartyId, SessionMessage)> {
        std::mem::take(&mut self.sent.lock())
    }
}

#[async_trait]
impl SessionSender for InMemorySessionSender {
    async fn send(&self, peer: PartyId, message: SessionMessage) -> Result<(), FlowError> {
        self.sent.lock().push((peer, message));
        Ok(())
    }
}

/// Executes the asynchronous operations flows suspend on.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    /// Run the operation to completion.
    async fn execute(&self, flow_id: FlowId, operation_id: OperationId) -> Result<(), FlowError>;
}

/// Runner whose operations all complete instantly.
pub struct NoopOperationRunner;

#[async_trait]
impl OperationRunner for NoopOperationRunner {
    async fn execute(&self, _flow_id: FlowId, _operation_id: OperationId) -> Result<(), FlowError> {
        Ok(())
    }
}

/// External contract validation for the notary service.
#[async_trait]
pub trait TransactionValidator: Send + Sync {
    /// Check the transaction's contract payload. `Err` carries the
    /// human-readable rejection cause.
    async fn validate(&self, tx_hash: Hash, payload: &[u8]) -> Result<(), String>;
}

/// Validator that accepts everything, for non-validating notary mode.
pub struct AcceptAllValidator;

#[async_trait]
impl TransactionValidator for AcceptAllValidator {
    async fn validate(&self, _tx_hash: Hash, _payload: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// Produces the notary's commitment signatures.
#[async_trait]
pub trait SigningService: Send + Sync {
    /// Sign `message` with the service identity key.
    async fn sign(&self, message: &[u8]) -> Result<Signature, String>;
}

/// Signing service holding the key in process.
pub struct LocalSigningService {
    keypair: KeyPair,
}

impl LocalSigningService {
    /// Service signing with `keypair`.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl SigningService for LocalSigningService {
    async fn sign(&self, message: &[u8]) -> Result<Signature, String> {
        Ok(self.keypair.sign(message))
    }
}
