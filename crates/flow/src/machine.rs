//! Per-flow state machine wrapping the transition engine.

use crate::checkpoint::Checkpoint;
use crate::transition::{FlowAction, FlowEvent, TransitionEngine};
use ledgerflow_core::StateMachine;
use ledgerflow_types::FlowError;
use std::time::Duration;
use tracing::error;

/// In-memory state of one live flow: the checkpoint plus the transient flags
/// the transition engine needs but never persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachineState {
    /// The durable snapshot, mutated in memory and persisted on demand.
    pub checkpoint: Checkpoint,
    /// Whether the flow's business logic is currently running on its fiber.
    /// While set, work events are deferred to the next suspension.
    pub is_resumed: bool,
    /// Whether the flow has been removed from the live table. Terminal.
    pub is_removed: bool,
    /// Whether a wakeup timer is armed for this flow.
    pub pending_wakeup: bool,
}

impl StateMachineState {
    /// State for a freshly created flow.
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self { checkpoint, is_resumed: false, is_removed: false, pending_wakeup: false }
    }

    /// State rebuilt from a persisted checkpoint on restart. Transient flags
    /// reset; queued sends replay on the next work event.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self::new(checkpoint)
    }
}

/// One flow as a deterministic state machine.
///
/// All decisions go through [`TransitionEngine::transition`]; this wrapper
/// owns the state, tracks the caller-provided clock, and downgrades contract
/// violations into captured fatal errors so a single misbehaving flow cannot
/// take the runner down.
#[derive(Debug)]
pub struct FlowStateMachine {
    state: StateMachineState,
    now: Duration,
}

impl FlowStateMachine {
    /// Machine for a freshly created flow.
    pub fn new(checkpoint: Checkpoint) -> Self {
        Self { state: StateMachineState::new(checkpoint), now: Duration::ZERO }
    }

    /// Machine rebuilt from a persisted checkpoint on restart.
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self { state: StateMachineState::from_checkpoint(checkpoint), now: Duration::ZERO }
    }

    /// Current in-memory state.
    pub fn state(&self) -> &StateMachineState {
        &self.state
    }

    /// Current in-memory checkpoint.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state.checkpoint
    }

    /// Whether the flow has been removed from the live table.
    pub fn is_removed(&self) -> bool {
        self.state.is_removed
    }

    /// Mark the flow's business logic as running (or yielded). Set by the
    /// runner around fiber execution.
    pub fn set_resumed(&mut self, resumed: bool) {
        self.state.is_resumed = resumed;
    }
}

impl StateMachine for FlowStateMachine {
    type Event = FlowEvent;
    type Action = FlowAction;

    fn handle(&mut self, event: FlowEvent) -> Vec<FlowAction> {
        match TransitionEngine::transition(&self.state, event, self.now) {
            Ok(transition) => {
                self.state = transition.state;
                transition.actions
            }
            Err(violation) => {
                error!(
                    flow_id = %self.state.checkpoint.flow_id,
                    error = %violation,
                    "flow transition contract violation"
                );
                let errors = vec![FlowError::fatal(0, violation.to_string())];
                match TransitionEngine::transition(
                    &self.state,
                    FlowEvent::Error { errors },
                    self.now,
                ) {
                    Ok(transition) => {
                        self.state = transition.state;
                        transition.actions
                    }
                    // Error capture itself never fails.
                    Err(_) => Vec::new(),
                }
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ErrorState, FlowState};
    use ledgerflow_test_helpers::party;
    use ledgerflow_types::FlowId;

    #[test]
    fn test_handle_applies_transition() {
        let checkpoint = Checkpoint::new(FlowId::from_bytes([1; 16]), party(1), None);
        let mut machine = FlowStateMachine::new(checkpoint);
        machine.set_time(Duration::from_secs(10));

        let actions = machine.handle(FlowEvent::DoRemainingWork);
        assert!(!actions.is_empty());
        assert!(matches!(machine.checkpoint().state, FlowState::Started { .. }));
    }

    #[test]
    fn test_contract_violation_becomes_fatal_error() {
        let mut checkpoint = Checkpoint::new(FlowId::from_bytes([2; 16]), party(1), None);
        checkpoint.state = FlowState::Completed;
        let mut machine = FlowStateMachine::new(checkpoint);

        let actions = machine.handle(FlowEvent::DoRemainingWork);
        assert!(!actions.is_empty());
        match &machine.checkpoint().error_state {
            ErrorState::Errored { errors, .. } => {
                assert_eq!(errors.len(), 1);
            }
            ErrorState::Clean => panic!("expected captured violation"),
        }
    }
}
