//! Cryptographic key pairs and signatures.
//!
//! Ed25519 only. The signing service collaborator wraps a `KeyPair`; the
//! notary protocol verifies request signatures against the requester's
//! `PartyId` (which is its public key).

use crate::PartyId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A cryptographic key pair for signing.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Generate a keypair from a seed (for testing/simulation).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        let sig = self.signing_key.sign(message);
        Signature(sig.to_bytes().to_vec())
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the party identity for this keypair.
    pub fn party_id(&self) -> PartyId {
        PartyId(self.signing_key.verifying_key().to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public_key())
    }
}

/// A public key for signature verification.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Verify a signature.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        use ed25519_dalek::Verifier;
        let pk = match ed25519_dalek::VerifyingKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig_array: [u8; 64] = match signature.0.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_array);
        pk.verify(message, &sig).is_ok()
    }
}

impl From<PartyId> for PublicKey {
    fn from(party: PartyId) -> Self {
        PublicKey(party.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", &hex::encode(&self.0[..4]))
    }
}

/// A detached ed25519 signature.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"commit tx";
        let sig = keypair.sign(message);
        assert!(keypair.public_key().verify(message, &sig));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let keypair = KeyPair::generate();
        let sig = keypair.sign(b"commit tx");
        assert!(!keypair.public_key().verify(b"commit other tx", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = keypair.sign(b"commit tx");
        assert!(!other.public_key().verify(b"commit tx", &sig));
    }

    #[test]
    fn test_seeded_keypair_deterministic() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[1u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.party_id(), b.party_id());
    }

    #[test]
    fn test_verify_rejects_malformed_signature() {
        let keypair = KeyPair::generate();
        let bad = Signature(vec![0u8; 7]);
        assert!(!keypair.public_key().verify(b"msg", &bad));
    }
}
