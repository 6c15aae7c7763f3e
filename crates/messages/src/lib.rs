//! Wire payloads exchanged between peers and the notary service.
//!
//! Two protocol families live here:
//!
//! - **Notary protocol**: signed notarisation requests and the responses the
//!   notary can return (interim wait-time updates, per-transaction outcomes,
//!   request-level errors).
//! - **Session protocol**: the envelope for flow-to-flow messaging (data,
//!   error propagation, session end).
//!
//! Serialization of these types to actual bytes is the transport's concern;
//! everything here is plain serde data.

mod notary;
mod session;

pub use notary::{
    CoreTransaction, NotarisationRequest, NotarisationResponse, NotaryError, NotaryResponse,
    SignedNotarisationRequest, TransactionOutcome,
};
pub use session::{SessionMessage, SessionPayload};
