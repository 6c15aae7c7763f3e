//! The flow executor: one tokio task per live flow.
//!
//! Each flow owns a mailbox and a [`FlowStateMachine`]; its task consumes
//! events strictly serially, executes the resulting actions in order, and
//! runs business logic steps between suspensions. Cross-flow concurrency is
//! free, per-flow execution never interleaves.
//!
//! Action execution preserves the engine's ordering guarantee: a checkpoint
//! is committed to the store before any send derived from the same
//! transition leaves the node. Timers are aborted before they are re-armed,
//! so a flow has at most one pending wakeup.

use crate::collaborators::{OperationRunner, SessionSender};
use crate::storage::CheckpointStore;
use ledgerflow_core::StateMachine;
use ledgerflow_flow::{
    Checkpoint, CheckpointBarrier, Continuation, ErrorState, FlowAction, FlowEvent, FlowHospital,
    FlowState, FlowStateMachine, RemovalReason, SessionUpdate, WaitingFor,
};
use ledgerflow_messages::{SessionMessage, SessionPayload};
use ledgerflow_types::{FlowError, FlowId, OperationId, PartyId, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wall clock injected into the machines, as a duration since the Unix
/// epoch. Tests substitute a controlled one.
pub type Clock = Arc<dyn Fn() -> Duration + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    })
}

/// What one business-logic step ended in.
pub struct FlowYield {
    /// Where the logic resumes, or [`Continuation::Finished`].
    pub continuation: Continuation,
    /// Sessions opened and payloads queued during the step.
    pub session_updates: Vec<SessionUpdate>,
    /// Whether the suspension must reach the store.
    pub barrier: CheckpointBarrier,
}

impl FlowYield {
    fn suspended(waiting_for: WaitingFor) -> Self {
        Self {
            continuation: Continuation::Suspended { suspension_id: 0, waiting_for },
            session_updates: Vec::new(),
            barrier: CheckpointBarrier::Persist,
        }
    }

    /// Suspend until a message arrives on `session_id`.
    pub fn receive(session_id: SessionId) -> Self {
        Self::suspended(WaitingFor::Receive { session_id })
    }

    /// Suspend until `wake_at` (duration since the Unix epoch).
    pub fn sleep(wake_at: Duration) -> Self {
        Self::suspended(WaitingFor::Sleep { wake_at })
    }

    /// Suspend until the given asynchronous operation completes.
    pub fn operation(operation_id: OperationId) -> Self {
        Self::suspended(WaitingFor::AsyncOperation { operation_id })
    }

    /// The logic ran to completion.
    pub fn finished() -> Self {
        Self {
            continuation: Continuation::Finished,
            session_updates: Vec::new(),
            barrier: CheckpointBarrier::Persist,
        }
    }

    /// Open a session towards `peer` as part of this step.
    pub fn open(mut self, session_id: SessionId, peer: PartyId) -> Self {
        self.session_updates.push(SessionUpdate::Open { session_id, peer });
        self
    }

    /// Queue a payload on an open session as part of this step.
    pub fn send(mut self, session_id: SessionId, payload: SessionPayload) -> Self {
        self.session_updates.push(SessionUpdate::Send { session_id, payload });
        self
    }
}

/// A flow's business logic as a deterministic step function.
///
/// Called whenever the flow is runnable; decides what to do from the
/// checkpoint alone (typically by `number_of_suspends`) plus the payload
/// that resumed it. Errors become captured flow errors and go to the
/// hospital.
pub trait FlowLogic: Send + Sync {
    /// Run until the next suspension.
    fn step(
        &self,
        checkpoint: &Checkpoint,
        last_delivered: Option<&(SessionId, SessionPayload)>,
    ) -> Result<FlowYield, FlowError>;
}

struct ExecutorInner {
    local_party: PartyId,
    store: Arc<dyn CheckpointStore>,
    sender: Arc<dyn SessionSender>,
    operations: Arc<dyn OperationRunner>,
    hospital: Mutex<FlowHospital>,
    clock: Clock,
    mailboxes: Mutex<HashMap<FlowId, mpsc::UnboundedSender<FlowEvent>>>,
    tasks: Mutex<HashMap<FlowId, JoinHandle<()>>>,
    /// Coarse trace of persist/send ordering, for tests.
    action_log: Mutex<Vec<String>>,
}

impl ExecutorInner {
    fn log(&self, flow_id: FlowId, what: &str) {
        self.action_log.lock().push(format!("{flow_id} {what}"));
    }
}

/// Spawns and supervises flow fibers.
pub struct FlowExecutor {
    inner: Arc<ExecutorInner>,
}

impl FlowExecutor {
    /// Executor sending as `local_party`.
    pub fn new(
        local_party: PartyId,
        store: Arc<dyn CheckpointStore>,
        sender: Arc<dyn SessionSender>,
        operations: Arc<dyn OperationRunner>,
        hospital: FlowHospital,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                local_party,
                store,
                sender,
                operations,
                hospital: Mutex::new(hospital),
                clock: system_clock(),
                mailboxes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                action_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the wall clock. Must be called before the first flow spawns,
    /// while the executor is the sole holder of its internals.
    ///
    /// # Panics
    ///
    /// Panics if the executor's internals are already shared with a fiber.
    pub fn with_clock(self, clock: Clock) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.clock = clock;
                Self { inner: Arc::new(inner) }
            }
            Err(_) => panic!("with_clock called after a flow was spawned"),
        }
    }

    /// Start a fresh flow running `logic`. Returns its id; the flow
    /// initializes and runs in the background.
    pub fn start_flow(&self, logic: Arc<dyn FlowLogic>) -> FlowId {
        let flow_id = FlowId::random();
        self.start_flow_with_id(flow_id, logic);
        flow_id
    }

    /// Start a fresh flow under a caller-chosen id, for callers that need to
    /// register the id elsewhere before the flow's first send.
    pub fn start_flow_with_id(&self, flow_id: FlowId, logic: Arc<dyn FlowLogic>) {
        let checkpoint = Checkpoint::new(flow_id, self.inner.local_party, None);
        self.spawn(FlowStateMachine::new(checkpoint), logic);
    }

    /// Start a flow created by a counterparty's initiating message.
    pub fn start_initiated_flow(
        &self,
        logic: Arc<dyn FlowLogic>,
        message: SessionMessage,
    ) -> FlowId {
        let flow_id = FlowId::random();
        let checkpoint = Checkpoint::new(flow_id, self.inner.local_party, Some(message));
        self.spawn(FlowStateMachine::new(checkpoint), logic);
        flow_id
    }

    /// Restart every stored non-terminal flow with `logic`. Returns the
    /// resumed flow ids.
    pub async fn resume_from_store(
        &self,
        logic: Arc<dyn FlowLogic>,
    ) -> Result<Vec<FlowId>, crate::storage::StorageError> {
        let mut resumed = Vec::new();
        for mut checkpoint in self.inner.store.list().await? {
            if checkpoint.is_terminal() {
                continue;
            }
            if let FlowState::Paused { resume } = &checkpoint.state {
                checkpoint.state = (**resume).clone();
            }
            info!(flow_id = %checkpoint.flow_id, "resuming flow from storage");
            resumed.push(checkpoint.flow_id);
            self.spawn(FlowStateMachine::from_checkpoint(checkpoint), logic.clone());
        }
        Ok(resumed)
    }

    /// Route an inbound session message to a live flow. Returns false if the
    /// flow is unknown.
    pub fn deliver(&self, flow_id: FlowId, message: SessionMessage) -> bool {
        self.send_event(flow_id, FlowEvent::DeliverSessionMessage { message })
    }

    /// Enqueue an event on a flow's mailbox. Returns false if the flow is
    /// unknown.
    pub fn send_event(&self, flow_id: FlowId, event: FlowEvent) -> bool {
        let mailboxes = self.inner.mailboxes.lock();
        match mailboxes.get(&flow_id) {
            Some(mailbox) => mailbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Park every live flow durably for shutdown.
    pub fn soft_shutdown(&self) {
        let mailboxes = self.inner.mailboxes.lock();
        for mailbox in mailboxes.values() {
            let _ = mailbox.send(FlowEvent::SoftShutdown);
        }
    }

    /// Number of live flows.
    pub fn live_flows(&self) -> usize {
        self.inner.mailboxes.lock().len()
    }

    /// Await a flow's fiber. Returns immediately for unknown flows.
    pub async fn join_flow(&self, flow_id: FlowId) {
        let task = self.inner.tasks.lock().remove(&flow_id);
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// The coarse persist/send trace, oldest first.
    pub fn action_log(&self) -> Vec<String> {
        self.inner.action_log.lock().clone()
    }

    fn spawn(&self, machine: FlowStateMachine, logic: Arc<dyn FlowLogic>) {
        let flow_id = machine.checkpoint().flow_id;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FlowEvent::DoRemainingWork);
        self.inner.mailboxes.lock().insert(flow_id, tx.clone());

        let fiber = Fiber {
            inner: Arc::clone(&self.inner),
            flow_id,
            logic,
            last_durable: machine.checkpoint().clone(),
            machine,
            self_tx: tx,
            timer: None,
            operation: None,
            parked: false,
            removal: None,
        };
        let task = tokio::spawn(fiber.run(rx));
        self.inner.tasks.lock().insert(flow_id, task);
    }
}

struct Fiber {
    inner: Arc<ExecutorInner>,
    flow_id: FlowId,
    logic: Arc<dyn FlowLogic>,
    machine: FlowStateMachine,
    /// Last checkpoint the store confirmed. Infrastructure faults rewind the
    /// machine here; its snapshot still holds the un-drained queues, so the
    /// retry replays anything that never left.
    last_durable: Checkpoint,
    self_tx: mpsc::UnboundedSender<FlowEvent>,
    timer: Option<JoinHandle<()>>,
    operation: Option<(OperationId, JoinHandle<()>)>,
    /// Set while the flow sits in overnight observation; suppresses
    /// readmission until the retry wakeup.
    parked: bool,
    removal: Option<RemovalReason>,
}

impl Fiber {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<FlowEvent>) {
        while self.removal.is_none() {
            let Some(event) = mailbox.recv().await else {
                break;
            };
            self.pump(event).await;
        }
        self.finish().await;
    }

    /// Process one external event plus everything that follows from it:
    /// logic steps while runnable, hospital admission when errored.
    async fn pump(&mut self, event: FlowEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            if self.removal.is_some() {
                break;
            }
            let was_wakeup = matches!(event, FlowEvent::WakeUpFromSleep);
            if was_wakeup {
                self.parked = false;
            }
            self.machine.set_time((self.inner.clock)());
            let actions = self.machine.handle(event);
            self.execute(actions).await;
            if self.removal.is_some() {
                break;
            }
            if self.is_runnable() {
                queue.push_back(self.step_logic());
            } else if let Some(verdict) = self.triage() {
                queue.push_back(verdict);
                queue.push_back(FlowEvent::DoRemainingWork);
            } else if was_wakeup && !self.machine.checkpoint().error_state.is_errored() {
                // A retry wakeup can land on a flow rewound to its last
                // durable checkpoint; that snapshot may still have
                // initialization or replay work outstanding.
                queue.push_back(FlowEvent::DoRemainingWork);
            }
        }
        self.launch_operation_if_waiting();
    }

    fn is_runnable(&self) -> bool {
        !self.machine.is_removed()
            && !self.machine.checkpoint().error_state.is_errored()
            && matches!(
                self.machine.checkpoint().state,
                FlowState::Started { continuation: Continuation::Runnable, .. }
            )
    }

    fn step_logic(&mut self) -> FlowEvent {
        let checkpoint = self.machine.checkpoint().clone();
        let last_delivered = match &checkpoint.state {
            FlowState::Started { last_delivered, .. } => last_delivered.clone(),
            _ => None,
        };
        self.machine.set_resumed(true);
        let result = self.logic.step(&checkpoint, last_delivered.as_ref());
        self.machine.set_resumed(false);
        match result {
            Ok(step) => FlowEvent::SuspendFlow {
                continuation: step.continuation,
                session_updates: step.session_updates,
                barrier: step.barrier,
            },
            Err(error) => {
                warn!(flow_id = %self.flow_id, %error, "flow logic failed");
                FlowEvent::Error { errors: vec![error] }
            }
        }
    }

    /// Admit an errored, unparked flow to the hospital and turn the
    /// diagnosis into an event.
    fn triage(&mut self) -> Option<FlowEvent> {
        if self.parked {
            return None;
        }
        let errors = match &self.machine.checkpoint().error_state {
            ErrorState::Errored { errors, propagating: false, .. } => errors.clone(),
            _ => return None,
        };
        let diagnosis = self.inner.hospital.lock().admit(self.flow_id, &errors);
        Some(match diagnosis {
            ledgerflow_flow::Diagnosis::Terminal | ledgerflow_flow::Diagnosis::NotMyError => {
                FlowEvent::StartErrorPropagation
            }
            ledgerflow_flow::Diagnosis::OvernightObservation { backoff } => {
                self.parked = true;
                FlowEvent::OvernightObservation { until: (self.inner.clock)() + backoff }
            }
            ledgerflow_flow::Diagnosis::ResuscitateImmediately => FlowEvent::WakeUpFromSleep,
        })
    }

    async fn execute(&mut self, actions: Vec<FlowAction>) {
        let mut staged: Option<Box<Checkpoint>> = None;
        let mut fault: Option<FlowError> = None;
        for action in actions {
            match action {
                FlowAction::CreateTransaction => {}
                FlowAction::PersistCheckpoint { checkpoint } => staged = Some(checkpoint),
                FlowAction::CommitTransaction => {
                    if let Some(checkpoint) = staged.take() {
                        match self.inner.store.save((*checkpoint).clone()).await {
                            Ok(()) => {
                                self.inner.log(self.flow_id, "persist");
                                self.last_durable = *checkpoint;
                            }
                            Err(error) => {
                                warn!(flow_id = %self.flow_id, %error, "checkpoint save failed");
                                // Nothing further from this transition may run:
                                // a send now would be observable before the
                                // checkpoint it depends on is durable.
                                fault = Some(FlowError::transient(
                                    self.machine.checkpoint().number_of_suspends,
                                    error.to_string(),
                                ));
                                break;
                            }
                        }
                    }
                }
                FlowAction::SendExistingSessionMessage { peer, message }
                | FlowAction::SendNewSessionMessage { peer, message } => {
                    self.inner.log(self.flow_id, "send");
                    if let Err(error) = self.inner.sender.send(peer, message).await {
                        warn!(flow_id = %self.flow_id, %error, "session send failed");
                        fault = Some(error);
                        break;
                    }
                }
                FlowAction::ScheduleWakeUp { at } => self.arm_timer(at),
                FlowAction::CancelWakeUp => self.disarm_timer(),
                FlowAction::PropagateErrors { sessions, errors } => {
                    self.propagate_errors(sessions, errors).await;
                }
                FlowAction::RemoveFlow { reason } => {
                    debug!(flow_id = %self.flow_id, ?reason, "flow removed");
                    self.removal = Some(reason);
                }
            }
        }
        if let Some(error) = fault {
            // Rewind to the last confirmed checkpoint and capture the
            // infrastructure failure there. The snapshot still holds the
            // queues the interrupted transition was draining, so the retry
            // replays them; receivers deduplicate by sequence number.
            self.machine = FlowStateMachine::from_checkpoint(self.last_durable.clone());
            self.machine.set_time((self.inner.clock)());
            let actions = self.machine.handle(FlowEvent::Error { errors: vec![error] });
            // Only the persist is applied here; it may fail again, which
            // matters once the store recovers.
            for action in actions {
                if let FlowAction::PersistCheckpoint { checkpoint } = action {
                    if self.inner.store.save((*checkpoint).clone()).await.is_ok() {
                        self.inner.log(self.flow_id, "persist");
                        self.last_durable = *checkpoint;
                    }
                }
            }
        }
    }

    async fn propagate_errors(
        &mut self,
        sessions: Vec<(SessionId, PartyId)>,
        errors: Vec<FlowError>,
    ) {
        let Some(error) = errors.first().cloned() else {
            return;
        };
        for (session_id, peer) in sessions {
            let sequence = self
                .machine
                .checkpoint()
                .sessions
                .get(&session_id)
                .map(|s| s.next_outbound_sequence)
                .unwrap_or(0);
            let message = SessionMessage {
                session_id,
                sender: self.inner.local_party,
                sequence,
                payload: SessionPayload::Error(error.clone()),
            };
            self.inner.log(self.flow_id, "send");
            if let Err(send_error) = self.inner.sender.send(peer, message).await {
                warn!(flow_id = %self.flow_id, %send_error, "error propagation send failed");
            }
        }
    }

    fn arm_timer(&mut self, at: Duration) {
        self.disarm_timer();
        let delay = at.saturating_sub((self.inner.clock)());
        let tx = self.self_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(FlowEvent::WakeUpFromSleep);
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// If the flow is (still) suspended on an async operation, make sure one
    /// is in flight.
    fn launch_operation_if_waiting(&mut self) {
        if self.removal.is_some() || self.machine.checkpoint().error_state.is_errored() {
            return;
        }
        let FlowState::Started {
            continuation:
                Continuation::Suspended {
                    waiting_for: WaitingFor::AsyncOperation { operation_id },
                    ..
                },
            ..
        } = self.machine.checkpoint().state
        else {
            return;
        };
        if let Some((running, task)) = &self.operation {
            if *running == operation_id && !task.is_finished() {
                return;
            }
        }
        let operations = Arc::clone(&self.inner.operations);
        let tx = self.self_tx.clone();
        let flow_id = self.flow_id;
        let task = tokio::spawn(async move {
            let event = match operations.execute(flow_id, operation_id).await {
                Ok(()) => FlowEvent::AsyncOperationCompletion { operation_id },
                Err(error) => FlowEvent::AsyncOperationThrows { operation_id, error },
            };
            let _ = tx.send(event);
        });
        self.operation = Some((operation_id, task));
    }

    async fn finish(mut self) {
        self.disarm_timer();
        if let Some((_, task)) = self.operation.take() {
            task.abort();
        }
        self.inner.mailboxes.lock().remove(&self.flow_id);
        match self.removal {
            Some(RemovalReason::Completed) | Some(RemovalReason::ErrorPropagated) => {
                if let Err(error) = self.inner.store.delete(self.flow_id).await {
                    warn!(flow_id = %self.flow_id, %error, "checkpoint delete failed");
                }
                self.inner.hospital.lock().discharge(self.flow_id);
            }
            // The checkpoint outlives a pause; restart picks it up.
            Some(RemovalReason::ShutdownPause) | None => {}
        }
        info!(flow_id = %self.flow_id, reason = ?self.removal, "flow fiber stopped");
    }
}
