//! Errors captured from flow execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a captured flow error, used by the hospital to pick a
/// disposition and by the checkpoint to decide what peers get told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowErrorClass {
    /// Error thrown by flow business logic. Propagated to peers as-is.
    Business,
    /// Transient infrastructure failure (connection drop, storage timeout).
    /// Candidates for retry after a backoff.
    TransientInfrastructure,
    /// Duplicate-key insert observed while replaying a checkpointed effect.
    /// Harmless: the effect already happened before the crash.
    StorageDuplicate,
    /// Unrecoverable infrastructure failure. Always fatal to the flow.
    FatalInfrastructure,
}

/// An error captured during flow execution, carried inside checkpoints and
/// propagated to peer sessions when the flow fails terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowError {
    /// Identifier correlating this error across local logs and peer sessions.
    pub error_id: u64,
    /// Human-readable description.
    pub message: String,
    /// Classification for hospital routing.
    pub class: FlowErrorClass,
}

impl FlowError {
    /// Capture a business-logic error.
    pub fn business(error_id: u64, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
            class: FlowErrorClass::Business,
        }
    }

    /// Capture a transient infrastructure error.
    pub fn transient(error_id: u64, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
            class: FlowErrorClass::TransientInfrastructure,
        }
    }

    /// Capture a duplicate-insert error seen during effect replay.
    pub fn duplicate(error_id: u64, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
            class: FlowErrorClass::StorageDuplicate,
        }
    }

    /// Capture a fatal infrastructure error.
    pub fn fatal(error_id: u64, message: impl Into<String>) -> Self {
        Self {
            error_id,
            message: message.into(),
            class: FlowErrorClass::FatalInfrastructure,
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.error_id, self.class, self.message)
    }
}

impl std::error::Error for FlowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_class() {
        assert_eq!(FlowError::business(1, "x").class, FlowErrorClass::Business);
        assert_eq!(
            FlowError::transient(2, "x").class,
            FlowErrorClass::TransientInfrastructure
        );
        assert_eq!(
            FlowError::fatal(3, "x").class,
            FlowErrorClass::FatalInfrastructure
        );
    }
}
