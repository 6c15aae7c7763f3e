//! Notary protocol payloads.

use ledgerflow_types::{
    notarisation_request_message, ConsumedStateDetails, Hash, PartyId, ProtocolVersion, PublicKey,
    Signature, StateRef, TimeWindow,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The notarisation-relevant core of one transaction.
///
/// `tx_hash` commits to the full transaction content; the notary only needs
/// the consumption set, the validity window, and the opaque payload it hands
/// to the contract validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreTransaction {
    /// Transaction id.
    pub tx_hash: Hash,
    /// States consumed by this transaction.
    pub inputs: Vec<StateRef>,
    /// States read but not consumed.
    pub references: Vec<StateRef>,
    /// Optional validity window checked against the notary clock.
    pub time_window: Option<TimeWindow>,
    /// The notary this transaction names.
    pub notary: PartyId,
    /// Hash of the network parameters the transaction was built against.
    pub network_parameters: Hash,
    /// Opaque contract payload, verified by the external validator.
    pub payload: Vec<u8>,
}

impl CoreTransaction {
    /// Total number of ledger states touched (inputs plus references).
    pub fn state_count(&self) -> usize {
        self.inputs.len() + self.references.len()
    }
}

/// A batch of transactions submitted for notarisation.
///
/// The single-transaction path is simply the size-1 case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarisationRequest {
    /// Transactions to commit, processed in order.
    pub transactions: Vec<CoreTransaction>,
    /// Identity of the submitting party.
    pub requester: PartyId,
    /// Protocol version the requester speaks.
    pub protocol_version: ProtocolVersion,
}

impl NotarisationRequest {
    /// Digest covering the request content, signed by the requester.
    pub fn digest(&self) -> Hash {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(self.transactions.len() + 2);
        for tx in &self.transactions {
            parts.push(tx.tx_hash.to_bytes().to_vec());
        }
        parts.push(self.requester.as_bytes().to_vec());
        parts.push(self.protocol_version.0.to_le_bytes().to_vec());
        let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Hash::from_parts(&refs)
    }

    /// Total number of ledger states across all transactions.
    pub fn total_state_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.state_count()).sum()
    }
}

/// A notarisation request plus the requester's detached signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedNotarisationRequest {
    /// The request content.
    pub request: NotarisationRequest,
    /// Requester signature over the domain-tagged request digest.
    pub signature: Signature,
}

impl SignedNotarisationRequest {
    /// Verify the signature against the requester identity claimed in the
    /// request itself.
    pub fn verify(&self) -> bool {
        let message = notarisation_request_message(&self.request.digest());
        PublicKey::from(self.request.requester).verify(&message, &self.signature)
    }
}

/// Outcome of notarising one transaction from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    /// Inputs committed; the signature proves it.
    Committed {
        /// The committed transaction.
        tx_hash: Hash,
        /// Notary signature over the transaction id.
        signature: Signature,
    },
    /// Transaction rejected; terminal for this transaction id.
    Rejected {
        /// The rejected transaction.
        tx_hash: Hash,
        /// Why it was rejected.
        error: NotaryError,
    },
}

impl TransactionOutcome {
    /// The transaction this outcome is about.
    pub fn tx_hash(&self) -> Hash {
        match self {
            TransactionOutcome::Committed { tx_hash, .. } => *tx_hash,
            TransactionOutcome::Rejected { tx_hash, .. } => *tx_hash,
        }
    }

    /// Whether the transaction committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }
}

/// Final response to a notarisation request: one outcome per transaction,
/// in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotarisationResponse {
    /// Per-transaction outcomes.
    pub outcomes: Vec<TransactionOutcome>,
}

/// Messages the notary can send back to a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotaryResponse {
    /// Interim backpressure notification: expect to wait about this long.
    WaitTimeUpdate {
        /// Estimated wait before the request is processed.
        estimate: Duration,
    },
    /// Final per-transaction outcomes.
    Outcome(NotarisationResponse),
    /// Request-level rejection (the request never reached per-transaction
    /// processing).
    Error(NotaryError),
}

impl NotaryResponse {
    /// Get a human-readable name for this response type.
    pub fn type_name(&self) -> &'static str {
        match self {
            NotaryResponse::WaitTimeUpdate { .. } => "WaitTimeUpdate",
            NotaryResponse::Outcome(_) => "Outcome",
            NotaryResponse::Error(_) => "Error",
        }
    }

    /// Whether this response terminates the request.
    pub fn is_final(&self) -> bool {
        !matches!(self, NotaryResponse::WaitTimeUpdate { .. })
    }
}

/// Errors a notary can return.
///
/// All of these are terminal for the request or transaction they concern;
/// the notary never retries on the client's behalf. `General` is the one
/// kind a client may safely resubmit, since committed requests replay
/// idempotently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum NotaryError {
    /// The transaction failed validation (contract failure, oversize request,
    /// parameters mismatch). Carries the underlying cause.
    #[error("Transaction {tx_hash:?} invalid: {cause}")]
    TransactionInvalid {
        /// The offending transaction.
        tx_hash: Hash,
        /// Underlying cause.
        cause: String,
    },

    /// One or more input states were already consumed by another transaction.
    #[error("Conflict for {tx_hash:?}: {} state(s) already consumed", consumed.len())]
    Conflict {
        /// The losing transaction.
        tx_hash: Hash,
        /// Exactly the overlapping references and their owning transactions.
        consumed: Vec<ConsumedStateDetails>,
    },

    /// The transaction names a different notary service.
    #[error("Transaction names notary {requested}, not this service")]
    WrongNotary {
        /// The notary the transaction asked for.
        requested: PartyId,
    },

    /// The request signature does not verify against the claimed requester.
    #[error("Request signature invalid: {cause}")]
    RequestSignatureInvalid {
        /// What went wrong.
        cause: String,
    },

    /// The notary clock falls outside the transaction's time window.
    #[error("Time window invalid: window {time_window:?}, notary time {notary_time:?}")]
    TimeWindowInvalid {
        /// The transaction's declared window.
        time_window: TimeWindow,
        /// The notary's trusted clock at evaluation time.
        notary_time: Duration,
    },

    /// Transient service-side failure. Safe to retry the whole request.
    #[error("Notarisation failed: {cause}")]
    General {
        /// Underlying cause.
        cause: String,
    },
}
