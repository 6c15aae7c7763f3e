//! Properly-signed fixtures for notary and flow tests.
//!
//! Everything here is deterministic: the same seed always yields the same
//! keys, identities, and transaction hashes, so tests can assert on exact
//! winners in conflict scenarios.

use ledgerflow_messages::{CoreTransaction, NotarisationRequest, SignedNotarisationRequest};
use ledgerflow_types::{
    notarisation_request_message, Hash, KeyPair, PartyId, ProtocolVersion, StateRef, TimeWindow,
};

/// Deterministic keypair from a one-byte seed.
pub fn keypair(seed: u8) -> KeyPair {
    KeyPair::from_seed(&[seed; 32])
}

/// Party identity of the deterministic keypair for `seed`.
pub fn party(seed: u8) -> PartyId {
    keypair(seed).party_id()
}

/// Declarative description of a test transaction.
///
/// The transaction hash is derived from the tag and the consumption set, so
/// two specs with different tags never collide and a cloned spec rebuilds
/// the identical transaction.
#[derive(Debug, Clone)]
pub struct TransactionSpec {
    tag: Vec<u8>,
    inputs: Vec<StateRef>,
    references: Vec<StateRef>,
    time_window: Option<TimeWindow>,
    notary: PartyId,
    network_parameters: Hash,
}

impl TransactionSpec {
    /// Start a spec for the given tag.
    pub fn new(tag: &[u8]) -> Self {
        Self {
            tag: tag.to_vec(),
            inputs: Vec::new(),
            references: Vec::new(),
            time_window: None,
            notary: PartyId([0u8; 32]),
            network_parameters: Hash::ZERO,
        }
    }

    /// Add an input state.
    pub fn input(mut self, state_ref: StateRef) -> Self {
        self.inputs.push(state_ref);
        self
    }

    /// Drop all inputs added so far.
    pub fn clear_inputs(mut self) -> Self {
        self.inputs.clear();
        self
    }

    /// Add a reference state.
    pub fn reference(mut self, state_ref: StateRef) -> Self {
        self.references.push(state_ref);
        self
    }

    /// Set the validity window.
    pub fn time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    /// Set the notary the transaction names.
    pub fn notary(mut self, notary: PartyId) -> Self {
        self.notary = notary;
        self
    }

    /// Set the network parameters hash.
    pub fn network_parameters(mut self, hash: Hash) -> Self {
        self.network_parameters = hash;
        self
    }
}

/// Build a core transaction from a spec.
pub fn transaction(spec: TransactionSpec) -> CoreTransaction {
    let mut parts: Vec<Vec<u8>> = vec![spec.tag.clone()];
    for input in &spec.inputs {
        parts.push(input.txhash.to_bytes().to_vec());
        parts.push(input.index.to_le_bytes().to_vec());
    }
    for reference in &spec.references {
        parts.push(reference.txhash.to_bytes().to_vec());
        parts.push(reference.index.to_le_bytes().to_vec());
    }
    let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    let tx_hash = Hash::from_parts(&refs);

    CoreTransaction {
        tx_hash,
        inputs: spec.inputs,
        references: spec.references,
        time_window: spec.time_window,
        notary: spec.notary,
        network_parameters: spec.network_parameters,
        payload: spec.tag,
    }
}

/// Build a signed request from the given transactions, signed by `requester`.
pub fn signed_request(
    requester: &KeyPair,
    transactions: Vec<CoreTransaction>,
) -> SignedNotarisationRequest {
    let request = NotarisationRequest {
        transactions,
        requester: requester.party_id(),
        protocol_version: ProtocolVersion(13),
    };
    let signature = requester.sign(&notarisation_request_message(&request.digest()));
    SignedNotarisationRequest { request, signature }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_is_deterministic() {
        let a = transaction(TransactionSpec::new(b"tx1"));
        let b = transaction(TransactionSpec::new(b"tx1"));
        let c = transaction(TransactionSpec::new(b"tx2"));
        assert_eq!(a.tx_hash, b.tx_hash);
        assert_ne!(a.tx_hash, c.tx_hash);
    }

    #[test]
    fn test_signed_request_verifies() {
        let requester = keypair(1);
        let request = signed_request(&requester, vec![transaction(TransactionSpec::new(b"tx"))]);
        assert!(request.verify());
    }
}
