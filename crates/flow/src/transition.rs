//! The pure transition engine: (state, event) to (new state, ordered actions).
//!
//! Every decision about a flow's lifecycle lives here, with no I/O and no
//! clock access beyond the `now` the caller passes in. The runner executes
//! the returned actions strictly in order; the engine guarantees that a
//! `PersistCheckpoint` precedes every send, propagation, or removal derived
//! from the same transition, so a crash between actions can at worst replay
//! effects the persisted sequence counters already deduplicate.

use crate::checkpoint::{Checkpoint, Continuation, ErrorState, FlowState, WaitingFor};
use crate::machine::StateMachineState;
use crate::session::SessionState;
use ledgerflow_messages::{SessionMessage, SessionPayload};
use ledgerflow_types::{FlowError, FlowId, OperationId, PartyId, SessionId};
use std::time::Duration;
use tracing::{debug, warn};

/// Input to one flow transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// Drive the flow forward from wherever it is: initialize an unstarted
    /// flow, replay unsent queues after a restart, or resume a suspension
    /// whose condition is already met.
    DoRemainingWork,
    /// A session message arrived from a peer.
    DeliverSessionMessage {
        /// The message, carrying its session and sequence number.
        message: SessionMessage,
    },
    /// Business logic yielded: it suspended, asked for a checkpoint, or ran
    /// to completion.
    SuspendFlow {
        /// Where the logic will resume, or [`Continuation::Finished`].
        continuation: Continuation,
        /// Sessions opened and payloads queued since the last suspension.
        session_updates: Vec<SessionUpdate>,
        /// Whether this suspension must reach the store. Forced to persist
        /// whenever `session_updates` is non-empty.
        barrier: CheckpointBarrier,
    },
    /// A timer armed by an earlier transition fired.
    WakeUpFromSleep,
    /// An asynchronous operation the flow was waiting on completed.
    AsyncOperationCompletion {
        /// The completed operation.
        operation_id: OperationId,
    },
    /// An asynchronous operation the flow was waiting on failed.
    AsyncOperationThrows {
        /// The failed operation.
        operation_id: OperationId,
        /// The failure.
        error: FlowError,
    },
    /// Record errors against the flow without yet informing peers.
    Error {
        /// The errors to capture, in occurrence order.
        errors: Vec<FlowError>,
    },
    /// Hospital verdict: the errors are final, inform peers and remove the
    /// flow.
    StartErrorPropagation,
    /// Hospital verdict: park the errored flow and retry at `until`.
    OvernightObservation {
        /// Absolute retry time (duration since the Unix epoch).
        until: Duration,
    },
    /// Park the flow durably for a node shutdown.
    SoftShutdown,
}

impl FlowEvent {
    /// Short name for logs and contract-violation errors.
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::DoRemainingWork => "DoRemainingWork",
            FlowEvent::DeliverSessionMessage { .. } => "DeliverSessionMessage",
            FlowEvent::SuspendFlow { .. } => "SuspendFlow",
            FlowEvent::WakeUpFromSleep => "WakeUpFromSleep",
            FlowEvent::AsyncOperationCompletion { .. } => "AsyncOperationCompletion",
            FlowEvent::AsyncOperationThrows { .. } => "AsyncOperationThrows",
            FlowEvent::Error { .. } => "Error",
            FlowEvent::StartErrorPropagation => "StartErrorPropagation",
            FlowEvent::OvernightObservation { .. } => "OvernightObservation",
            FlowEvent::SoftShutdown => "SoftShutdown",
        }
    }
}

/// A session-table change carried by a [`FlowEvent::SuspendFlow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The flow opened a new session towards `peer`.
    Open {
        /// Identifier chosen by the flow.
        session_id: SessionId,
        /// Counterparty.
        peer: PartyId,
    },
    /// The flow queued a payload on an existing session.
    Send {
        /// Target session.
        session_id: SessionId,
        /// Payload to queue.
        payload: SessionPayload,
    },
}

/// Whether a suspension needs to reach durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointBarrier {
    /// Persist before any observable effect.
    Persist,
    /// In-memory only; permissible only when the suspension produced no
    /// observable effects.
    Skip,
}

/// Why a flow is being removed from the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Ran to completion; the checkpoint can be deleted.
    Completed,
    /// Errors were propagated; the checkpoint can be deleted.
    ErrorPropagated,
    /// Paused for shutdown; the checkpoint must be kept for restart.
    ShutdownPause,
}

/// One ordered instruction for the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    /// Open a storage transaction.
    CreateTransaction,
    /// Write the checkpoint inside the open storage transaction.
    PersistCheckpoint {
        /// Snapshot to write, replacing any previous one wholesale.
        checkpoint: Box<Checkpoint>,
    },
    /// Commit the open storage transaction.
    CommitTransaction,
    /// Send a message on a session the peer already knows about.
    SendExistingSessionMessage {
        /// Destination.
        peer: PartyId,
        /// The message.
        message: SessionMessage,
    },
    /// Send the first message of a locally initiated session.
    SendNewSessionMessage {
        /// Destination.
        peer: PartyId,
        /// The message.
        message: SessionMessage,
    },
    /// Arm a timer that delivers [`FlowEvent::WakeUpFromSleep`] at `at`.
    ScheduleWakeUp {
        /// Absolute fire time (duration since the Unix epoch).
        at: Duration,
    },
    /// Disarm any pending timer for this flow.
    CancelWakeUp,
    /// Send the given errors to each listed session's peer.
    PropagateErrors {
        /// Sessions still open, in table order.
        sessions: Vec<(SessionId, PartyId)>,
        /// The errors to deliver.
        errors: Vec<FlowError>,
    },
    /// Drop the flow from the live table.
    RemoveFlow {
        /// Decides whether the checkpoint outlives the removal.
        reason: RemovalReason,
    },
}

/// Result of a successful transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The state after the transition.
    pub state: StateMachineState,
    /// Actions for the runner, to be executed strictly in order.
    pub actions: Vec<FlowAction>,
}

/// Contract violations between the runner and the engine. These indicate a
/// bug, not a recoverable condition; the state machine converts them into a
/// fatal flow error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The event is not legal in the flow's current lifecycle state.
    #[error("flow {flow_id} cannot handle {event} while {state}")]
    InvalidFlowState {
        /// The flow.
        flow_id: FlowId,
        /// Lifecycle state name at the time of the event.
        state: &'static str,
        /// Event name.
        event: &'static str,
    },
    /// A hospital verdict arrived for a flow with no captured errors.
    #[error("flow {flow_id} is not errored")]
    NotErrored {
        /// The flow.
        flow_id: FlowId,
    },
    /// An operation named a session the flow does not have.
    #[error("flow {flow_id} has no session {session_id}")]
    UnknownSession {
        /// The flow.
        flow_id: FlowId,
        /// The missing session.
        session_id: SessionId,
    },
    /// A session open reused an identifier already in the table.
    #[error("flow {flow_id} already has session {session_id}")]
    DuplicateSession {
        /// The flow.
        flow_id: FlowId,
        /// The reused identifier.
        session_id: SessionId,
    },
    /// A send was queued on a session that has already seen its end.
    #[error("flow {flow_id} session {session_id} is closed")]
    SessionClosed {
        /// The flow.
        flow_id: FlowId,
        /// The closed session.
        session_id: SessionId,
    },
}

/// The pure flow transition function.
pub struct TransitionEngine;

impl TransitionEngine {
    /// Compute the transition for `event` against `state` at time `now`.
    ///
    /// Pure: same inputs always yield the same output, and the input state
    /// is never mutated.
    pub fn transition(
        state: &StateMachineState,
        event: FlowEvent,
        now: Duration,
    ) -> Result<Transition, TransitionError> {
        let mut next = state.clone();
        let mut actions = Vec::new();

        match event {
            FlowEvent::DoRemainingWork => {
                if next.is_resumed || next.is_removed {
                    return Ok(Transition { state: next, actions });
                }
                match &next.checkpoint.error_state {
                    ErrorState::Errored { propagating: true, .. } => {
                        Self::propagate(&mut next, &mut actions)?;
                    }
                    // Parked until the hospital decides a disposition.
                    ErrorState::Errored { .. } => {}
                    ErrorState::Clean => Self::remaining_work(&mut next, now, &mut actions)?,
                }
            }
            FlowEvent::DeliverSessionMessage { message } => {
                Self::deliver(&mut next, message, &mut actions);
            }
            FlowEvent::SuspendFlow { continuation, session_updates, barrier } => {
                Self::suspend(&mut next, continuation, session_updates, barrier, &mut actions)?;
            }
            FlowEvent::WakeUpFromSleep => {
                Self::wake(&mut next, &mut actions);
            }
            FlowEvent::AsyncOperationCompletion { operation_id } => {
                Self::operation_completed(&mut next, operation_id, &mut actions);
            }
            FlowEvent::AsyncOperationThrows { operation_id, error } => {
                Self::operation_threw(&mut next, operation_id, error, &mut actions);
            }
            FlowEvent::Error { errors } => {
                warn!(
                    flow_id = %next.checkpoint.flow_id,
                    count = errors.len(),
                    "capturing flow errors"
                );
                Self::capture(&mut next.checkpoint, errors);
                Self::persist(&next.checkpoint, &mut actions);
            }
            FlowEvent::StartErrorPropagation => {
                Self::propagate(&mut next, &mut actions)?;
            }
            FlowEvent::OvernightObservation { until } => {
                Self::observe(&mut next, until, &mut actions)?;
            }
            FlowEvent::SoftShutdown => {
                Self::soft_shutdown(&mut next, &mut actions);
            }
        }

        Ok(Transition { state: next, actions })
    }

    fn remaining_work(
        state: &mut StateMachineState,
        now: Duration,
        actions: &mut Vec<FlowAction>,
    ) -> Result<(), TransitionError> {
        let flow_id = state.checkpoint.flow_id;
        match state.checkpoint.state.clone() {
            FlowState::Unstarted { initiating_message } => {
                if let Some(message) = initiating_message {
                    let mut session =
                        SessionState::initiated_by_peer(message.session_id, message.sender);
                    session.next_inbound_sequence = message.sequence + 1;
                    session.received.push_back(message.payload);
                    state.checkpoint.sessions.insert(message.session_id, session);
                }
                state.checkpoint.state = FlowState::Started {
                    continuation: Continuation::Runnable,
                    last_delivered: None,
                };
                Self::persist(&state.checkpoint, actions);
            }
            FlowState::Started { continuation, .. } => {
                // Anything still queued comes from the persisted snapshot of
                // a previous run, so sending without a fresh persist is safe.
                Self::flush_sends(&mut state.checkpoint, actions);
                match continuation {
                    Continuation::Runnable | Continuation::Finished => {}
                    Continuation::Suspended {
                        waiting_for: WaitingFor::Receive { session_id },
                        ..
                    } => {
                        if Self::try_resume_receive(&mut state.checkpoint, session_id)? {
                            Self::persist(&state.checkpoint, actions);
                        }
                    }
                    Continuation::Suspended {
                        waiting_for: WaitingFor::Sleep { wake_at },
                        ..
                    } => {
                        if now >= wake_at {
                            if state.pending_wakeup {
                                actions.push(FlowAction::CancelWakeUp);
                                state.pending_wakeup = false;
                            }
                            state.checkpoint.state = FlowState::Started {
                                continuation: Continuation::Runnable,
                                last_delivered: None,
                            };
                            Self::persist(&state.checkpoint, actions);
                        } else if !state.pending_wakeup {
                            actions.push(FlowAction::ScheduleWakeUp { at: wake_at });
                            state.pending_wakeup = true;
                        }
                    }
                    // The runner restarts the operation after a recovery; the
                    // checkpoint itself has nothing to do.
                    Continuation::Suspended {
                        waiting_for: WaitingFor::AsyncOperation { .. },
                        ..
                    } => {}
                }
            }
            FlowState::Completed | FlowState::Paused { .. } => {
                return Err(TransitionError::InvalidFlowState {
                    flow_id,
                    state: state.checkpoint.state.name(),
                    event: "DoRemainingWork",
                });
            }
        }
        Ok(())
    }

    fn deliver(
        state: &mut StateMachineState,
        message: SessionMessage,
        actions: &mut Vec<FlowAction>,
    ) {
        if state.is_removed {
            debug!(
                flow_id = %state.checkpoint.flow_id,
                session_id = %message.session_id,
                "dropping delivery to removed flow"
            );
            return;
        }
        let session = state
            .checkpoint
            .sessions
            .entry(message.session_id)
            .or_insert_with(|| SessionState::initiated_by_peer(message.session_id, message.sender));
        if message.sequence < session.next_inbound_sequence {
            debug!(
                flow_id = %state.checkpoint.flow_id,
                session_id = %message.session_id,
                sequence = message.sequence,
                "dropping duplicate session message"
            );
            return;
        }
        session.next_inbound_sequence = message.sequence + 1;
        if let SessionPayload::Error(error) = &message.payload {
            session.peer_error = Some(error.clone());
        }
        session.received.push_back(message.payload);

        // If the flow is suspended on exactly this session, hand the payload
        // over in the same transition.
        if !state.checkpoint.error_state.is_errored() {
            if let FlowState::Started {
                continuation:
                    Continuation::Suspended { waiting_for: WaitingFor::Receive { session_id }, .. },
                ..
            } = state.checkpoint.state
            {
                if session_id == message.session_id {
                    // The session exists; resumption cannot fail here.
                    let _ = Self::try_resume_receive(&mut state.checkpoint, session_id);
                }
            }
        }
        Self::persist(&state.checkpoint, actions);
    }

    fn suspend(
        state: &mut StateMachineState,
        continuation: Continuation,
        session_updates: Vec<SessionUpdate>,
        barrier: CheckpointBarrier,
        actions: &mut Vec<FlowAction>,
    ) -> Result<(), TransitionError> {
        let flow_id = state.checkpoint.flow_id;
        if state.is_removed {
            debug!(flow_id = %flow_id, "ignoring suspension of removed flow");
            return Ok(());
        }
        if state.checkpoint.error_state.is_errored() {
            // The fiber raced an error capture; the hospital owns the flow now.
            debug!(flow_id = %flow_id, "discarding suspension of errored flow");
            return Ok(());
        }
        if !matches!(state.checkpoint.state, FlowState::Started { .. }) {
            return Err(TransitionError::InvalidFlowState {
                flow_id,
                state: state.checkpoint.state.name(),
                event: "SuspendFlow",
            });
        }

        let has_updates = !session_updates.is_empty();
        for update in session_updates {
            Self::apply_session_update(&mut state.checkpoint, update)?;
        }
        state.is_resumed = false;

        match continuation {
            Continuation::Finished => {
                for session in state.checkpoint.sessions.values_mut() {
                    if !session.closed && session.peer_error.is_none() {
                        session.send_queue.push_back(SessionPayload::End);
                        session.closed = true;
                    }
                }
                state.checkpoint.state = FlowState::Completed;
                Self::persist(&state.checkpoint, actions);
                Self::flush_sends(&mut state.checkpoint, actions);
                actions.push(FlowAction::RemoveFlow { reason: RemovalReason::Completed });
                state.is_removed = true;
            }
            continuation => {
                state.checkpoint.number_of_suspends += 1;
                let continuation = match continuation {
                    Continuation::Suspended { waiting_for, .. } => Continuation::Suspended {
                        suspension_id: state.checkpoint.number_of_suspends,
                        waiting_for,
                    },
                    other => other,
                };
                state.checkpoint.state = FlowState::Started { continuation, last_delivered: None };

                // A buffered payload satisfies a receive suspension right away.
                if let FlowState::Started {
                    continuation:
                        Continuation::Suspended {
                            waiting_for: WaitingFor::Receive { session_id }, ..
                        },
                    ..
                } = state.checkpoint.state
                {
                    Self::try_resume_receive(&mut state.checkpoint, session_id)?;
                }

                if matches!(barrier, CheckpointBarrier::Persist) || has_updates {
                    Self::persist(&state.checkpoint, actions);
                }
                Self::flush_sends(&mut state.checkpoint, actions);

                if let FlowState::Started {
                    continuation:
                        Continuation::Suspended { waiting_for: WaitingFor::Sleep { wake_at }, .. },
                    ..
                } = state.checkpoint.state
                {
                    actions.push(FlowAction::ScheduleWakeUp { at: wake_at });
                    state.pending_wakeup = true;
                }
            }
        }
        Ok(())
    }

    fn apply_session_update(
        checkpoint: &mut Checkpoint,
        update: SessionUpdate,
    ) -> Result<(), TransitionError> {
        let flow_id = checkpoint.flow_id;
        match update {
            SessionUpdate::Open { session_id, peer } => {
                if checkpoint.sessions.contains_key(&session_id) {
                    return Err(TransitionError::DuplicateSession { flow_id, session_id });
                }
                checkpoint.sessions.insert(session_id, SessionState::initiated(session_id, peer));
            }
            SessionUpdate::Send { session_id, payload } => {
                let session = checkpoint
                    .sessions
                    .get_mut(&session_id)
                    .ok_or(TransitionError::UnknownSession { flow_id, session_id })?;
                if session.closed {
                    return Err(TransitionError::SessionClosed { flow_id, session_id });
                }
                session.send_queue.push_back(payload);
            }
        }
        Ok(())
    }

    fn wake(state: &mut StateMachineState, actions: &mut Vec<FlowAction>) {
        state.pending_wakeup = false;
        match &state.checkpoint.error_state {
            ErrorState::Errored { propagating: false, .. } => {
                // Hospital-scheduled retry: clear the errors and rerun from
                // the last good checkpoint.
                debug!(flow_id = %state.checkpoint.flow_id, "retrying errored flow");
                state.checkpoint.error_state = ErrorState::Clean;
                Self::persist(&state.checkpoint, actions);
            }
            ErrorState::Errored { propagating: true, .. } => {}
            ErrorState::Clean => {
                if let FlowState::Started {
                    continuation:
                        Continuation::Suspended { waiting_for: WaitingFor::Sleep { .. }, .. },
                    ..
                } = state.checkpoint.state
                {
                    state.checkpoint.state = FlowState::Started {
                        continuation: Continuation::Runnable,
                        last_delivered: None,
                    };
                    Self::persist(&state.checkpoint, actions);
                } else {
                    debug!(flow_id = %state.checkpoint.flow_id, "ignoring stale wakeup");
                }
            }
        }
    }

    fn operation_completed(
        state: &mut StateMachineState,
        operation_id: OperationId,
        actions: &mut Vec<FlowAction>,
    ) {
        if state.checkpoint.error_state.is_errored() {
            return;
        }
        match state.checkpoint.state {
            FlowState::Started {
                continuation:
                    Continuation::Suspended {
                        waiting_for: WaitingFor::AsyncOperation { operation_id: waiting },
                        ..
                    },
                ..
            } if waiting == operation_id => {
                state.checkpoint.state = FlowState::Started {
                    continuation: Continuation::Runnable,
                    last_delivered: None,
                };
                Self::persist(&state.checkpoint, actions);
            }
            _ => {
                debug!(
                    flow_id = %state.checkpoint.flow_id,
                    operation_id = %operation_id,
                    "ignoring stale operation completion"
                );
            }
        }
    }

    fn operation_threw(
        state: &mut StateMachineState,
        operation_id: OperationId,
        error: FlowError,
        actions: &mut Vec<FlowAction>,
    ) {
        match state.checkpoint.state {
            FlowState::Started {
                continuation:
                    Continuation::Suspended {
                        waiting_for: WaitingFor::AsyncOperation { operation_id: waiting },
                        ..
                    },
                ..
            } if waiting == operation_id => {
                warn!(
                    flow_id = %state.checkpoint.flow_id,
                    operation_id = %operation_id,
                    error = %error,
                    "async operation failed"
                );
                Self::capture(&mut state.checkpoint, vec![error]);
                Self::persist(&state.checkpoint, actions);
            }
            _ => {
                debug!(
                    flow_id = %state.checkpoint.flow_id,
                    operation_id = %operation_id,
                    "ignoring stale operation failure"
                );
            }
        }
    }

    fn capture(checkpoint: &mut Checkpoint, new_errors: Vec<FlowError>) {
        match &mut checkpoint.error_state {
            ErrorState::Clean => {
                checkpoint.error_state = ErrorState::Errored {
                    errors: new_errors,
                    propagating: false,
                    propagated_index: 0,
                };
            }
            ErrorState::Errored { errors, .. } => errors.extend(new_errors),
        }
    }

    fn propagate(
        state: &mut StateMachineState,
        actions: &mut Vec<FlowAction>,
    ) -> Result<(), TransitionError> {
        let flow_id = state.checkpoint.flow_id;
        let (errors, start_index) = match &mut state.checkpoint.error_state {
            ErrorState::Errored { errors, propagating, propagated_index } => {
                *propagating = true;
                let start = *propagated_index;
                (errors.clone(), start)
            }
            ErrorState::Clean => return Err(TransitionError::NotErrored { flow_id }),
        };
        let targets: Vec<(SessionId, PartyId)> = state
            .checkpoint
            .sessions
            .values()
            .skip(start_index)
            .filter(|s| !s.closed && s.peer_error.is_none())
            .map(|s| (s.session_id, s.peer))
            .collect();
        // The snapshot keeps the old propagated_index so a replay after a
        // crash re-emits the sends; the index only advances in memory, the
        // same way flush_sends persists the pre-drain queues.
        Self::persist(&state.checkpoint, actions);
        if let ErrorState::Errored { propagated_index, .. } = &mut state.checkpoint.error_state {
            *propagated_index = state.checkpoint.sessions.len();
        }
        if !targets.is_empty() {
            actions.push(FlowAction::PropagateErrors { sessions: targets, errors });
        }
        actions.push(FlowAction::RemoveFlow { reason: RemovalReason::ErrorPropagated });
        state.is_removed = true;
        Ok(())
    }

    fn observe(
        state: &mut StateMachineState,
        until: Duration,
        actions: &mut Vec<FlowAction>,
    ) -> Result<(), TransitionError> {
        let flow_id = state.checkpoint.flow_id;
        match &state.checkpoint.error_state {
            ErrorState::Errored { propagating: false, .. } => {
                Self::persist(&state.checkpoint, actions);
                actions.push(FlowAction::ScheduleWakeUp { at: until });
                state.pending_wakeup = true;
                Ok(())
            }
            ErrorState::Errored { propagating: true, .. } => {
                debug!(flow_id = %flow_id, "ignoring observation of propagating flow");
                Ok(())
            }
            ErrorState::Clean => Err(TransitionError::NotErrored { flow_id }),
        }
    }

    fn soft_shutdown(state: &mut StateMachineState, actions: &mut Vec<FlowAction>) {
        if state.is_removed || matches!(state.checkpoint.state, FlowState::Completed) {
            return;
        }
        let resume = Box::new(state.checkpoint.state.clone());
        state.checkpoint.state = FlowState::Paused { resume };
        Self::persist(&state.checkpoint, actions);
        if state.pending_wakeup {
            actions.push(FlowAction::CancelWakeUp);
            state.pending_wakeup = false;
        }
        actions.push(FlowAction::RemoveFlow { reason: RemovalReason::ShutdownPause });
        state.is_removed = true;
    }

    /// Pop the head of the session's receive queue into the flow, if any.
    ///
    /// Returns whether the flow moved (to Runnable on data, or to Errored on
    /// a propagated peer error).
    fn try_resume_receive(
        checkpoint: &mut Checkpoint,
        session_id: SessionId,
    ) -> Result<bool, TransitionError> {
        let flow_id = checkpoint.flow_id;
        let payload = {
            let session = checkpoint
                .sessions
                .get_mut(&session_id)
                .ok_or(TransitionError::UnknownSession { flow_id, session_id })?;
            match session.received.pop_front() {
                Some(payload) => payload,
                None => return Ok(false),
            }
        };
        match payload {
            SessionPayload::Error(error) => {
                Self::capture(checkpoint, vec![error]);
            }
            payload => {
                if matches!(payload, SessionPayload::End) {
                    if let Some(session) = checkpoint.sessions.get_mut(&session_id) {
                        session.closed = true;
                    }
                }
                checkpoint.state = FlowState::Started {
                    continuation: Continuation::Runnable,
                    last_delivered: Some((session_id, payload)),
                };
            }
        }
        Ok(true)
    }

    /// Drain every session's send queue into send actions, in table order.
    ///
    /// Callers persist first when the queued payloads are new; replayed
    /// queues are already covered by the persisted snapshot they came from.
    fn flush_sends(checkpoint: &mut Checkpoint, actions: &mut Vec<FlowAction>) {
        let local_party = checkpoint.local_party;
        for session in checkpoint.sessions.values_mut() {
            while let Some(payload) = session.send_queue.pop_front() {
                let first = session.is_unopened();
                let message = SessionMessage {
                    session_id: session.session_id,
                    sender: local_party,
                    sequence: session.next_outbound_sequence,
                    payload,
                };
                session.next_outbound_sequence += 1;
                actions.push(if first {
                    FlowAction::SendNewSessionMessage { peer: session.peer, message }
                } else {
                    FlowAction::SendExistingSessionMessage { peer: session.peer, message }
                });
            }
        }
    }

    fn persist(checkpoint: &Checkpoint, actions: &mut Vec<FlowAction>) {
        actions.push(FlowAction::CreateTransaction);
        actions.push(FlowAction::PersistCheckpoint { checkpoint: Box::new(checkpoint.clone()) });
        actions.push(FlowAction::CommitTransaction);
    }
}
