//! Core abstractions shared by the notary and flow state machines.

mod request;
mod traits;

pub use request::RequestId;
pub use traits::StateMachine;
