//! End-to-end scenarios across the runners: concurrent notarisation against
//! one uniqueness store, and full flow lifecycles over real tokio tasks.

use async_trait::async_trait;
use ledgerflow_flow::{Checkpoint, FlowHospital, HospitalConfig};
use ledgerflow_messages::{
    NotaryError, NotaryResponse, SessionMessage, SessionPayload, TransactionOutcome,
};
use ledgerflow_notary::{InMemoryUniquenessProvider, NotaryConfig};
use ledgerflow_runtime::{
    AcceptAllValidator, CheckpointStore, FlowExecutor, FlowLogic, FlowYield,
    InMemoryCheckpointStore, InMemorySessionSender, LocalSigningService, NoopOperationRunner,
    NotaryRunner, SessionSender, StorageError,
};
use ledgerflow_test_helpers::{keypair, party, signed_request, transaction, TransactionSpec};
use ledgerflow_types::{FlowError, FlowId, Hash, PartyId, SessionId, StateRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn notary_runner() -> Arc<NotaryRunner> {
    let notary = keypair(99);
    let config = NotaryConfig::new(notary.party_id(), Hash::from_bytes(b"params"));
    Arc::new(NotaryRunner::new(
        config,
        Arc::new(InMemoryUniquenessProvider::new()),
        Arc::new(AcceptAllValidator),
        Arc::new(LocalSigningService::new(notary)),
    ))
}

fn spend(tag: &[u8], input: StateRef) -> TransactionSpec {
    TransactionSpec::new(tag)
        .notary(keypair(99).party_id())
        .network_parameters(Hash::from_bytes(b"params"))
        .input(input)
}

async fn final_response(mut rx: tokio::sync::mpsc::UnboundedReceiver<NotaryResponse>) -> NotaryResponse {
    while let Some(response) = rx.recv().await {
        if response.is_final() {
            return response;
        }
    }
    panic!("response channel closed without a final response");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_double_spend_has_exactly_one_winner() {
    let runner = notary_runner();
    let requester = keypair(1);
    let contested = StateRef::new(Hash::from_bytes(b"genesis"), 0);

    let mut submissions = Vec::new();
    for i in 0u8..8 {
        let runner = Arc::clone(&runner);
        let request = signed_request(
            &requester,
            vec![transaction(spend(&[b't', b'x', i], contested))],
        );
        submissions.push(tokio::spawn(async move {
            final_response(runner.submit(request).await).await
        }));
    }

    let mut committed = 0;
    let mut conflicted = 0;
    for submission in submissions {
        let NotaryResponse::Outcome(response) = submission.await.unwrap() else {
            panic!("expected an outcome");
        };
        match &response.outcomes[0] {
            TransactionOutcome::Committed { .. } => committed += 1,
            TransactionOutcome::Rejected {
                error: NotaryError::Conflict { consumed, .. },
                ..
            } => {
                assert_eq!(consumed[0].state_ref, contested);
                conflicted += 1;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(conflicted, 7);
}

#[tokio::test]
async fn test_replaying_a_committed_transaction_succeeds_again() {
    let runner = notary_runner();
    let requester = keypair(1);
    let tx = transaction(spend(b"tx1", StateRef::new(Hash::from_bytes(b"genesis"), 1)));

    for _ in 0..2 {
        let response =
            final_response(runner.submit(signed_request(&requester, vec![tx.clone()])).await).await;
        let NotaryResponse::Outcome(response) = response else {
            panic!("expected an outcome");
        };
        assert!(response.outcomes[0].is_committed());
    }
    assert_eq!(runner.pending_requests(), 0);
}

#[tokio::test]
async fn test_wait_time_update_precedes_outcome_under_load() {
    let notary = keypair(99);
    let provider = InMemoryUniquenessProvider::new()
        .with_wait_per_state(Duration::from_secs(20));
    let runner = NotaryRunner::new(
        NotaryConfig::new(notary.party_id(), Hash::from_bytes(b"params")),
        Arc::new(provider),
        Arc::new(AcceptAllValidator),
        Arc::new(LocalSigningService::new(notary)),
    );
    let requester = keypair(1);
    let request = signed_request(
        &requester,
        vec![transaction(spend(b"tx1", StateRef::new(Hash::from_bytes(b"genesis"), 2)))],
    );

    let mut rx = runner.submit(request).await;
    let first = rx.recv().await.unwrap();
    assert!(matches!(first, NotaryResponse::WaitTimeUpdate { estimate } if estimate > Duration::ZERO));
    let second = rx.recv().await.unwrap();
    assert!(matches!(second, NotaryResponse::Outcome(_)));
}

/// Opens one session, sends a greeting, and completes.
struct SendAndFinish {
    peer: PartyId,
}

impl FlowLogic for SendAndFinish {
    fn step(
        &self,
        _checkpoint: &Checkpoint,
        _last_delivered: Option<&(SessionId, SessionPayload)>,
    ) -> Result<FlowYield, FlowError> {
        Ok(FlowYield::finished()
            .open(SessionId(1), self.peer)
            .send(SessionId(1), SessionPayload::Data(b"hello".to_vec())))
    }
}

#[tokio::test]
#[traced_test]
async fn test_checkpoint_committed_before_first_send() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let sender = Arc::new(InMemorySessionSender::new());
    let executor = FlowExecutor::new(
        party(1),
        store.clone(),
        sender.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    );

    let flow_id = executor.start_flow(Arc::new(SendAndFinish { peer: party(2) }));
    executor.join_flow(flow_id).await;

    let log = executor.action_log();
    let first_persist = log.iter().position(|e| e.ends_with("persist")).unwrap();
    let first_send = log.iter().position(|e| e.ends_with("send")).unwrap();
    assert!(first_persist < first_send, "log: {log:?}");

    // Data then session end, both addressed to the peer.
    let sent = sender.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0].1.payload, SessionPayload::Data(d) if d == b"hello"));
    assert!(matches!(&sent[1].1.payload, SessionPayload::End));

    // Completion deletes the checkpoint.
    assert!(store.is_empty());
    assert_eq!(executor.live_flows(), 0);
}

/// Routes messages between executors, creating responder flows on first
/// contact the way a real session layer would.
struct Router {
    nodes: Mutex<HashMap<PartyId, RouterNode>>,
}

struct RouterNode {
    executor: Arc<FlowExecutor>,
    logic: Arc<dyn FlowLogic>,
    flows: HashMap<SessionId, FlowId>,
}

impl Router {
    fn new() -> Self {
        Self { nodes: Mutex::new(HashMap::new()) }
    }

    fn register(&self, party: PartyId, executor: Arc<FlowExecutor>, logic: Arc<dyn FlowLogic>) {
        self.nodes
            .lock()
            .insert(party, RouterNode { executor, logic, flows: HashMap::new() });
    }

    /// Route future messages on `session_id` to an already-running flow.
    fn bind(&self, party: PartyId, session_id: SessionId, flow_id: FlowId) {
        if let Some(node) = self.nodes.lock().get_mut(&party) {
            node.flows.insert(session_id, flow_id);
        }
    }
}

#[async_trait]
impl SessionSender for Router {
    async fn send(&self, peer: PartyId, message: SessionMessage) -> Result<(), FlowError> {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get_mut(&peer) else {
            return Ok(());
        };
        match node.flows.get(&message.session_id) {
            Some(flow_id) => {
                node.executor.deliver(*flow_id, message);
            }
            None => {
                let session_id = message.session_id;
                let flow_id = node.executor.start_initiated_flow(node.logic.clone(), message);
                node.flows.insert(session_id, flow_id);
            }
        }
        Ok(())
    }
}

/// Sends "ping", records the reply, and completes.
struct PingLogic {
    peer: PartyId,
    replies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FlowLogic for PingLogic {
    fn step(
        &self,
        checkpoint: &Checkpoint,
        last_delivered: Option<&(SessionId, SessionPayload)>,
    ) -> Result<FlowYield, FlowError> {
        match checkpoint.number_of_suspends {
            0 => Ok(FlowYield::receive(SessionId(1))
                .open(SessionId(1), self.peer)
                .send(SessionId(1), SessionPayload::Data(b"ping".to_vec()))),
            _ => {
                match last_delivered {
                    Some((_, SessionPayload::Data(bytes))) => {
                        self.replies.lock().push(bytes.clone());
                    }
                    other => {
                        return Err(FlowError::business(1, format!("unexpected reply: {other:?}")))
                    }
                }
                Ok(FlowYield::finished())
            }
        }
    }
}

/// Waits for the opening message and answers it with "pong".
struct PongLogic;

impl FlowLogic for PongLogic {
    fn step(
        &self,
        checkpoint: &Checkpoint,
        last_delivered: Option<&(SessionId, SessionPayload)>,
    ) -> Result<FlowYield, FlowError> {
        let session_id = *checkpoint
            .sessions
            .keys()
            .next()
            .ok_or_else(|| FlowError::business(1, "no initiating session"))?;
        match checkpoint.number_of_suspends {
            0 => Ok(FlowYield::receive(session_id)),
            _ => match last_delivered {
                Some((_, SessionPayload::Data(_))) => Ok(FlowYield::finished()
                    .send(session_id, SessionPayload::Data(b"pong".to_vec()))),
                other => Err(FlowError::business(2, format!("unexpected delivery: {other:?}"))),
            },
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong_across_two_executors() {
    let router = Arc::new(Router::new());
    let replies = Arc::new(Mutex::new(Vec::new()));

    let store_a = Arc::new(InMemoryCheckpointStore::new());
    let store_b = Arc::new(InMemoryCheckpointStore::new());
    let executor_a = Arc::new(FlowExecutor::new(
        party(1),
        store_a.clone(),
        router.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    ));
    let executor_b = Arc::new(FlowExecutor::new(
        party(2),
        store_b.clone(),
        router.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    ));
    router.register(party(1), executor_a.clone(), Arc::new(PongLogic));
    router.register(party(2), executor_b.clone(), Arc::new(PongLogic));

    // Bind before starting so the reply routes to the initiator.
    let ping = FlowId::random();
    router.bind(party(1), SessionId(1), ping);
    executor_a.start_flow_with_id(ping, Arc::new(PingLogic {
        peer: party(2),
        replies: replies.clone(),
    }));
    executor_a.join_flow(ping).await;

    assert_eq!(replies.lock().clone(), vec![b"pong".to_vec()]);
    assert!(store_a.is_empty());
}

/// Completes on its first step; used for infrastructure-fault tests.
struct FinishImmediately;

impl FlowLogic for FinishImmediately {
    fn step(
        &self,
        _checkpoint: &Checkpoint,
        _last_delivered: Option<&(SessionId, SessionPayload)>,
    ) -> Result<FlowYield, FlowError> {
        Ok(FlowYield::finished())
    }
}

#[tokio::test]
#[traced_test]
async fn test_transient_storage_failure_is_retried_to_completion() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    store.fail_next_saves(1);
    let sender = Arc::new(InMemorySessionSender::new());
    let executor = FlowExecutor::new(
        party(1),
        store.clone(),
        sender,
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig {
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }),
    );

    let flow_id = executor.start_flow(Arc::new(FinishImmediately));
    executor.join_flow(flow_id).await;

    // The flow survived the failed save, retried after the backoff, and
    // completed cleanly.
    assert!(store.is_empty());
    assert_eq!(executor.live_flows(), 0);
}

/// Store that fails exactly one save: the `fail_on`th it sees.
struct FailNthSaveStore {
    inner: InMemoryCheckpointStore,
    seen: AtomicU32,
    fail_on: u32,
}

impl FailNthSaveStore {
    fn new(fail_on: u32) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            seen: AtomicU32::new(0),
            fail_on,
        }
    }
}

#[async_trait]
impl CheckpointStore for FailNthSaveStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StorageError::Unavailable("injected save failure".into()));
        }
        self.inner.save(checkpoint).await
    }

    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.load(flow_id).await
    }

    async fn delete(&self, flow_id: FlowId) -> Result<(), StorageError> {
        self.inner.delete(flow_id).await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.list().await
    }
}

#[tokio::test]
#[traced_test]
async fn test_sends_stay_queued_until_their_checkpoint_commits() {
    // The second save is the one covering the transition that opens the
    // session and queues the ping.
    let store = Arc::new(FailNthSaveStore::new(2));
    let sender = Arc::new(InMemorySessionSender::new());
    let replies = Arc::new(Mutex::new(Vec::new()));
    let executor = FlowExecutor::new(
        party(1),
        store.clone(),
        sender.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig {
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }),
    );

    let flow_id = executor.start_flow(Arc::new(PingLogic {
        peer: party(2),
        replies: replies.clone(),
    }));

    // Wait for the hospital retry to re-run the step and commit it.
    let mut waited = Duration::ZERO;
    while sender.sent().is_empty() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert!(!sender.sent().is_empty(), "ping never sent");

    // Answer the waiting receive so the flow completes normally.
    executor.deliver(
        flow_id,
        SessionMessage {
            session_id: SessionId(1),
            sender: party(2),
            sequence: 0,
            payload: SessionPayload::Data(b"pong".to_vec()),
        },
    );
    executor.join_flow(flow_id).await;

    // One ping and one end: the send staged by the failed commit never left,
    // and the retry did not duplicate it.
    let sent = sender.sent();
    assert_eq!(sent.len(), 2, "sent: {sent:?}");
    assert!(matches!(&sent[0].1.payload, SessionPayload::Data(d) if d == b"ping"));
    assert!(matches!(&sent[1].1.payload, SessionPayload::End));
    assert_eq!(replies.lock().clone(), vec![b"pong".to_vec()]);
    assert!(store.inner.is_empty());
}

#[tokio::test]
#[should_panic(expected = "with_clock called after a flow was spawned")]
async fn test_clock_swap_after_spawn_panics() {
    let executor = FlowExecutor::new(
        party(1),
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(InMemorySessionSender::new()),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    );
    let _flow = executor.start_flow(Arc::new(FinishImmediately));
    let _ = executor.with_clock(Arc::new(|| Duration::ZERO));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_soft_shutdown_then_restart_resumes_and_completes() {
    let router = Arc::new(Router::new());
    let replies = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemoryCheckpointStore::new());

    let executor = Arc::new(FlowExecutor::new(
        party(1),
        store.clone(),
        router.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    ));
    // No responder registered yet: the ping leaves, no pong comes back, so
    // the flow parks on its receive.
    let ping = executor.start_flow(Arc::new(PingLogic {
        peer: party(2),
        replies: replies.clone(),
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;

    executor.soft_shutdown();
    executor.join_flow(ping).await;
    assert_eq!(store.len(), 1, "pause keeps the checkpoint");

    // Restart from storage; the responder exists this time.
    let restarted = Arc::new(FlowExecutor::new(
        party(1),
        store.clone(),
        router.clone(),
        Arc::new(NoopOperationRunner),
        FlowHospital::with_default_staff(HospitalConfig::default()),
    ));
    router.register(party(1), restarted.clone(), Arc::new(PongLogic));

    let resumed = restarted
        .resume_from_store(Arc::new(PingLogic { peer: party(2), replies: replies.clone() }))
        .await
        .unwrap();
    assert_eq!(resumed, vec![ping]);

    // Answer the waiting receive directly.
    restarted.deliver(
        ping,
        SessionMessage {
            session_id: SessionId(1),
            sender: party(2),
            sequence: 0,
            payload: SessionPayload::Data(b"pong".to_vec()),
        },
    );
    restarted.join_flow(ping).await;

    assert_eq!(replies.lock().clone(), vec![b"pong".to_vec()]);
    assert!(store.is_empty());
}
