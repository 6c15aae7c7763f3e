//! Domain-separated signing for notarisation messages.
//!
//! Each signed message type carries a unique domain tag prefix so a signature
//! produced in one context can never be replayed in another.
//!
//! | Tag | Purpose |
//! |-----|---------|
//! | `notarisation_request:` | Requester's signature over a request digest |
//! | `notarisation_response:` | Notary's signature committing a transaction |

use crate::Hash;

/// Domain tag for requester signatures over notarisation requests.
///
/// Format: `notarisation_request:` || request_digest
pub const DOMAIN_NOTARISATION_REQUEST: &[u8] = b"notarisation_request:";

/// Domain tag for the notary's commitment signature.
///
/// Format: `notarisation_response:` || tx_hash
pub const DOMAIN_NOTARISATION_RESPONSE: &[u8] = b"notarisation_response:";

/// Build the signing message for a notarisation request.
///
/// The digest covers the full request content (transactions, requester,
/// protocol version), so the signature binds the requester to exactly the
/// set of state consumptions it asked for.
pub fn notarisation_request_message(request_digest: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_NOTARISATION_REQUEST.len() + Hash::BYTES);
    message.extend_from_slice(DOMAIN_NOTARISATION_REQUEST);
    message.extend_from_slice(request_digest.as_bytes());
    message
}

/// Build the signing message for the notary's response signature.
///
/// The notary signs the transaction id alone; possession of this signature
/// proves the transaction's inputs were committed exactly once.
pub fn notarisation_response_message(tx_hash: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_NOTARISATION_RESPONSE.len() + Hash::BYTES);
    message.extend_from_slice(DOMAIN_NOTARISATION_RESPONSE);
    message.extend_from_slice(tx_hash.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_message_deterministic() {
        let digest = Hash::from_bytes(b"request");
        let msg1 = notarisation_request_message(&digest);
        let msg2 = notarisation_request_message(&digest);
        assert_eq!(msg1, msg2);
        assert!(msg1.starts_with(DOMAIN_NOTARISATION_REQUEST));
    }

    #[test]
    fn test_different_domains_produce_different_messages() {
        let hash = Hash::from_bytes(b"same_hash_value_here");
        let request_msg = notarisation_request_message(&hash);
        let response_msg = notarisation_response_message(&hash);
        assert_ne!(request_msg, response_msg);
    }
}
