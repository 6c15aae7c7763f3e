//! The notary commit protocol, one state machine per service.
//!
//! Each request moves through phases:
//!
//! ```text
//! RequestReceived
//!     │  signature / identity / parameters / size checks
//!     ▼
//! (WaitTimeUpdate)?        best-effort backpressure, version-gated
//!     │
//!     ▼
//! AwaitingValidation       runner round-trips the contract validator
//!     │  UniquenessProvider::commit
//!     ▼
//! AwaitingSignature        runner round-trips the signing service
//!     │
//!     ▼
//! SendResponse             per-transaction outcomes, in submission order
//! ```
//!
//! The machine itself is synchronous and deterministic: signing and contract
//! validation happen in the runner, queued via actions and answered via
//! events, mirroring how the provider coordinator queues signature
//! verification.

use crate::config::NotaryConfig;
use crate::uniqueness::UniquenessProvider;
use ledgerflow_core::{RequestId, StateMachine};
use ledgerflow_messages::{
    CoreTransaction, NotarisationResponse, NotaryError, NotaryResponse, SignedNotarisationRequest,
    TransactionOutcome,
};
use ledgerflow_types::{Hash, PartyId, ProtocolVersion, Signature};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Events consumed by the notary protocol.
#[derive(Debug, Clone)]
pub enum NotaryEvent {
    /// A signed notarisation request arrived from a peer.
    RequestReceived {
        /// Runner-assigned correlation id.
        request_id: RequestId,
        /// The request.
        request: SignedNotarisationRequest,
    },
    /// The external contract validator finished checking a transaction.
    ValidationCompleted {
        /// Correlation id of the owning request.
        request_id: RequestId,
        /// The validated transaction.
        tx_hash: Hash,
        /// `Ok` or the verification failure message.
        result: Result<(), String>,
    },
    /// The signing service produced the commitment signature.
    ResponseSigned {
        /// Correlation id of the owning request.
        request_id: RequestId,
        /// The committed transaction.
        tx_hash: Hash,
        /// Notary signature over the transaction id.
        signature: Signature,
    },
}

/// Actions emitted by the notary protocol for the runner to execute.
#[derive(Debug, Clone)]
pub enum NotaryAction {
    /// Best-effort interim wait-time notification. Non-blocking; losing it
    /// never affects the commit.
    SendWaitTimeUpdate {
        /// Target request.
        request_id: RequestId,
        /// Estimated wait.
        estimate: Duration,
    },
    /// Hand a transaction payload to the external contract validator.
    ValidateTransaction {
        /// Owning request.
        request_id: RequestId,
        /// Transaction under validation.
        tx_hash: Hash,
        /// Opaque contract payload.
        payload: Vec<u8>,
    },
    /// Ask the signing service for a commitment signature over `tx_hash`.
    SignResponse {
        /// Owning request.
        request_id: RequestId,
        /// Committed transaction.
        tx_hash: Hash,
    },
    /// Deliver a response to the requester.
    SendResponse {
        /// Target request.
        request_id: RequestId,
        /// The response payload.
        response: NotaryResponse,
    },
}

/// Where a pending request currently is.
#[derive(Debug)]
enum RequestPhase {
    /// Waiting for the contract validator's verdict on `tx`.
    AwaitingValidation { tx: CoreTransaction },
    /// Waiting for the signing service to sign `tx_hash`.
    AwaitingSignature { tx_hash: Hash },
}

/// Book-keeping for one in-flight request.
#[derive(Debug)]
struct PendingRequest {
    requester: PartyId,
    protocol_version: ProtocolVersion,
    /// Transactions not yet processed, in submission order.
    remaining: VecDeque<CoreTransaction>,
    /// Finished outcomes, in submission order.
    outcomes: Vec<TransactionOutcome>,
    phase: Option<RequestPhase>,
}

impl PendingRequest {
    fn state_backlog(&self) -> usize {
        self.remaining.iter().map(|tx| tx.state_count()).sum()
    }
}

/// The notary commit protocol state machine.
pub struct NotaryProtocol {
    config: NotaryConfig,
    provider: Arc<dyn UniquenessProvider>,
    pending: HashMap<RequestId, PendingRequest>,
    now: Duration,
}

impl NotaryProtocol {
    /// Create a protocol instance over the given uniqueness provider.
    pub fn new(config: NotaryConfig, provider: Arc<dyn UniquenessProvider>) -> Self {
        Self {
            config,
            provider,
            pending: HashMap::new(),
            now: Duration::ZERO,
        }
    }

    /// Number of requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drop an in-flight request, for when a collaborator fails terminally
    /// and no response can be produced.
    pub fn abandon(&mut self, request_id: RequestId) {
        if self.pending.remove(&request_id).is_some() {
            warn!(%request_id, "abandoning in-flight request");
        }
    }

    /// Ledger states across all queued transactions, the load figure fed to
    /// the wait-time estimator.
    fn state_backlog(&self) -> usize {
        self.pending.values().map(|p| p.state_backlog()).sum()
    }

    fn on_request(
        &mut self,
        request_id: RequestId,
        request: SignedNotarisationRequest,
    ) -> Vec<NotaryAction> {
        let mut actions = Vec::new();

        if !request.verify() {
            warn!(%request_id, "rejecting request with invalid signature");
            actions.push(NotaryAction::SendResponse {
                request_id,
                response: NotaryResponse::Error(NotaryError::RequestSignatureInvalid {
                    cause: "signature does not match claimed requester identity".into(),
                }),
            });
            return actions;
        }

        let request = request.request;
        let pending = PendingRequest {
            requester: request.requester,
            protocol_version: request.protocol_version,
            remaining: request.transactions.into(),
            outcomes: Vec::new(),
            phase: None,
        };

        // Backpressure: estimate includes everything already queued plus
        // this request, and is only told to peers that understand it.
        let load = self.state_backlog() + pending.state_backlog();
        let estimate = self.provider.estimated_wait_time(load);
        if estimate > self.config.eta_notify_threshold
            && pending.protocol_version >= self.config.backpressure_min_version
        {
            debug!(%request_id, ?estimate, "notifying requester of expected wait");
            actions.push(NotaryAction::SendWaitTimeUpdate {
                request_id,
                estimate,
            });
        }

        self.pending.insert(request_id, pending);
        self.advance(request_id, &mut actions);
        actions
    }

    /// Static per-transaction checks that run before the uniqueness store is
    /// touched. Order matters: identity, then parameters, then size.
    fn static_checks(&self, tx: &CoreTransaction) -> Result<(), NotaryError> {
        if tx.notary != self.config.service_identity {
            return Err(NotaryError::WrongNotary {
                requested: tx.notary,
            });
        }
        if tx.network_parameters != self.config.network_parameters {
            return Err(NotaryError::TransactionInvalid {
                tx_hash: tx.tx_hash,
                cause: format!(
                    "network parameters mismatch: transaction built against {}, service accepts {}",
                    tx.network_parameters, self.config.network_parameters
                ),
            });
        }
        if tx.state_count() > self.config.max_ledger_states {
            return Err(NotaryError::TransactionInvalid {
                tx_hash: tx.tx_hash,
                cause: format!(
                    "too many states: {} > {} allowed",
                    tx.state_count(),
                    self.config.max_ledger_states
                ),
            });
        }
        Ok(())
    }

    /// Drive a request forward until it blocks on a collaborator round trip
    /// or finishes. Statically invalid transactions are rejected inline.
    fn advance(&mut self, request_id: RequestId, actions: &mut Vec<NotaryAction>) {
        let Some(mut pending) = self.pending.remove(&request_id) else {
            return;
        };

        while let Some(tx) = pending.remaining.pop_front() {
            match self.static_checks(&tx) {
                Err(error) => {
                    pending.outcomes.push(TransactionOutcome::Rejected {
                        tx_hash: tx.tx_hash,
                        error,
                    });
                }
                Ok(()) => {
                    actions.push(NotaryAction::ValidateTransaction {
                        request_id,
                        tx_hash: tx.tx_hash,
                        payload: tx.payload.clone(),
                    });
                    pending.phase = Some(RequestPhase::AwaitingValidation { tx });
                    self.pending.insert(request_id, pending);
                    return;
                }
            }
        }

        // Nothing left to process: respond with outcomes in submission order.
        actions.push(NotaryAction::SendResponse {
            request_id,
            response: NotaryResponse::Outcome(NotarisationResponse {
                outcomes: pending.outcomes,
            }),
        });
    }

    fn on_validation_completed(
        &mut self,
        request_id: RequestId,
        tx_hash: Hash,
        result: Result<(), String>,
    ) -> Vec<NotaryAction> {
        let mut actions = Vec::new();
        let Some(pending) = self.pending.get_mut(&request_id) else {
            warn!(%request_id, "validation result for unknown request");
            return actions;
        };
        let tx = match pending.phase.take() {
            Some(RequestPhase::AwaitingValidation { tx }) if tx.tx_hash == tx_hash => tx,
            other => {
                warn!(%request_id, %tx_hash, ?other, "stale validation result, ignoring");
                pending.phase = other;
                return actions;
            }
        };

        match result {
            Err(cause) => {
                pending.outcomes.push(TransactionOutcome::Rejected {
                    tx_hash,
                    error: NotaryError::TransactionInvalid { tx_hash, cause },
                });
                self.advance(request_id, &mut actions);
            }
            Ok(()) => {
                let commit = self.provider.commit(
                    tx.tx_hash,
                    pending.requester,
                    &tx.inputs,
                    &tx.references,
                    tx.time_window,
                    self.now,
                    self.config.clock_tolerance,
                );
                match commit {
                    Ok(()) => {
                        pending.phase = Some(RequestPhase::AwaitingSignature { tx_hash });
                        actions.push(NotaryAction::SignResponse {
                            request_id,
                            tx_hash,
                        });
                    }
                    Err(error) => {
                        debug!(%request_id, %tx_hash, %error, "commit rejected");
                        pending
                            .outcomes
                            .push(TransactionOutcome::Rejected { tx_hash, error });
                        self.advance(request_id, &mut actions);
                    }
                }
            }
        }
        actions
    }

    fn on_response_signed(
        &mut self,
        request_id: RequestId,
        tx_hash: Hash,
        signature: Signature,
    ) -> Vec<NotaryAction> {
        let mut actions = Vec::new();
        let Some(pending) = self.pending.get_mut(&request_id) else {
            warn!(%request_id, "signature for unknown request");
            return actions;
        };
        match pending.phase.take() {
            Some(RequestPhase::AwaitingSignature { tx_hash: expected }) if expected == tx_hash => {
                pending.outcomes.push(TransactionOutcome::Committed {
                    tx_hash,
                    signature,
                });
                self.advance(request_id, &mut actions);
            }
            other => {
                warn!(%request_id, %tx_hash, ?other, "stale signature, ignoring");
                pending.phase = other;
            }
        }
        actions
    }
}

impl StateMachine for NotaryProtocol {
    type Event = NotaryEvent;
    type Action = NotaryAction;

    fn handle(&mut self, event: NotaryEvent) -> Vec<NotaryAction> {
        match event {
            NotaryEvent::RequestReceived {
                request_id,
                request,
            } => self.on_request(request_id, request),
            NotaryEvent::ValidationCompleted {
                request_id,
                tx_hash,
                result,
            } => self.on_validation_completed(request_id, tx_hash, result),
            NotaryEvent::ResponseSigned {
                request_id,
                tx_hash,
                signature,
            } => self.on_response_signed(request_id, tx_hash, signature),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
