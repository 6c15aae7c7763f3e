//! Async service loop around the notary protocol machine.
//!
//! Submissions share one protocol instance behind a lock; the lock is held
//! only across synchronous `handle` calls, never across the validator or
//! signer round trips, so independent requests overlap freely while the
//! uniqueness store stays the single serialization point.

use crate::collaborators::{SigningService, TransactionValidator};
use ledgerflow_core::{RequestId, StateMachine};
use ledgerflow_messages::{NotaryError, NotaryResponse, SignedNotarisationRequest};
use ledgerflow_notary::{
    NotaryAction, NotaryConfig, NotaryEvent, NotaryProtocol, UniquenessProvider,
};
use ledgerflow_types::notarisation_response_message;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// One notary service: protocol machine plus its collaborators.
pub struct NotaryRunner {
    protocol: Mutex<NotaryProtocol>,
    validator: Arc<dyn TransactionValidator>,
    signer: Arc<dyn SigningService>,
    channels: Mutex<HashMap<RequestId, mpsc::UnboundedSender<NotaryResponse>>>,
    next_request: AtomicU64,
}

impl NotaryRunner {
    /// Build a service over the given uniqueness provider and collaborators.
    pub fn new(
        config: NotaryConfig,
        provider: Arc<dyn UniquenessProvider>,
        validator: Arc<dyn TransactionValidator>,
        signer: Arc<dyn SigningService>,
    ) -> Self {
        Self {
            protocol: Mutex::new(NotaryProtocol::new(config, provider)),
            validator,
            signer,
            channels: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        }
    }

    /// Submit a signed request and drive it to completion.
    ///
    /// The returned receiver yields zero or more interim
    /// [`NotaryResponse::WaitTimeUpdate`] messages followed by exactly one
    /// final response.
    pub async fn submit(
        &self,
        request: SignedNotarisationRequest,
    ) -> mpsc::UnboundedReceiver<NotaryResponse> {
        let request_id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().insert(request_id, tx);

        let actions = {
            let mut protocol = self.protocol.lock();
            protocol.set_time(wall_clock());
            protocol.handle(NotaryEvent::RequestReceived { request_id, request })
        };
        self.execute(actions).await;
        rx
    }

    /// Requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.protocol.lock().pending_requests()
    }

    async fn execute(&self, actions: Vec<NotaryAction>) {
        let mut queue: VecDeque<NotaryAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                NotaryAction::SendWaitTimeUpdate { request_id, estimate } => {
                    self.respond(request_id, NotaryResponse::WaitTimeUpdate { estimate }, false);
                }
                NotaryAction::ValidateTransaction { request_id, tx_hash, payload } => {
                    let result = self.validator.validate(tx_hash, &payload).await;
                    let mut protocol = self.protocol.lock();
                    protocol.set_time(wall_clock());
                    queue.extend(protocol.handle(NotaryEvent::ValidationCompleted {
                        request_id,
                        tx_hash,
                        result,
                    }));
                }
                NotaryAction::SignResponse { request_id, tx_hash } => {
                    let message = notarisation_response_message(&tx_hash);
                    match self.signer.sign(&message).await {
                        Ok(signature) => {
                            let mut protocol = self.protocol.lock();
                            queue.extend(protocol.handle(NotaryEvent::ResponseSigned {
                                request_id,
                                tx_hash,
                                signature,
                            }));
                        }
                        Err(cause) => {
                            error!(%request_id, %tx_hash, cause, "signing service failed");
                            self.protocol.lock().abandon(request_id);
                            self.respond(
                                request_id,
                                NotaryResponse::Error(NotaryError::General {
                                    cause: format!("signing failed: {cause}"),
                                }),
                                true,
                            );
                        }
                    }
                }
                NotaryAction::SendResponse { request_id, response } => {
                    self.respond(request_id, response, true);
                }
            }
        }
    }

    fn respond(&self, request_id: RequestId, response: NotaryResponse, last: bool) {
        let mut channels = self.channels.lock();
        let delivered = match channels.get(&request_id) {
            Some(channel) => channel.send(response).is_ok(),
            None => false,
        };
        if !delivered {
            warn!(%request_id, "requester gone before response");
        }
        if last {
            channels.remove(&request_id);
        }
    }
}

fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}
