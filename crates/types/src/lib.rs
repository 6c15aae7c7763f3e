//! Core types for the Ledgerflow notary and flow engine.
//!
//! Everything in this crate is a plain value type: hashes, state references,
//! identities, time windows, signing keys. No I/O, no async, no global state.

mod crypto;
mod flow_error;
mod hash;
mod identifiers;
mod signing;
mod state_ref;
mod time_window;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use flow_error::{FlowError, FlowErrorClass};
pub use hash::{Hash, HexError};
pub use identifiers::{FlowId, OperationId, PartyId, ProtocolVersion, SessionId};
pub use signing::{
    notarisation_request_message, notarisation_response_message, DOMAIN_NOTARISATION_REQUEST,
    DOMAIN_NOTARISATION_RESPONSE,
};
pub use state_ref::{ConsumedStateDetails, ConsumptionType, StateRef};
pub use time_window::TimeWindow;
