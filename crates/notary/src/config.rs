//! Notary service configuration.

use ledgerflow_types::{Hash, PartyId, ProtocolVersion};
use std::time::Duration;

/// Configuration for a notary service instance.
#[derive(Debug, Clone)]
pub struct NotaryConfig {
    /// Identity this service commits under. Transactions naming any other
    /// notary are rejected with `WrongNotary`.
    pub service_identity: PartyId,
    /// Hash of the currently accepted network parameters.
    pub network_parameters: Hash,
    /// Ceiling on inputs + references per request. Oversize requests are
    /// rejected before touching the uniqueness store.
    pub max_ledger_states: usize,
    /// Emit a `WaitTimeUpdate` when the estimated wait exceeds this.
    pub eta_notify_threshold: Duration,
    /// Clock drift tolerance for time-window checks.
    pub clock_tolerance: Duration,
    /// Minimum requester protocol version for backpressure notifications.
    pub backpressure_min_version: ProtocolVersion,
}

impl NotaryConfig {
    /// Config with defaulted limits for the given service identity and
    /// accepted parameters.
    pub fn new(service_identity: PartyId, network_parameters: Hash) -> Self {
        Self {
            service_identity,
            network_parameters,
            // Matches the default per-transaction component ceiling of the
            // wider platform.
            max_ledger_states: 10_000,
            eta_notify_threshold: Duration::from_secs(10),
            clock_tolerance: Duration::from_secs(30),
            backpressure_min_version: ProtocolVersion::BACKPRESSURE_NOTIFICATIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_types::KeyPair;

    #[test]
    fn test_defaults() {
        let config = NotaryConfig::new(
            KeyPair::from_seed(&[1u8; 32]).party_id(),
            Hash::from_bytes(b"params"),
        );
        assert_eq!(config.max_ledger_states, 10_000);
        assert_eq!(config.clock_tolerance, Duration::from_secs(30));
        assert!(config.backpressure_min_version.supports_backpressure());
    }
}
