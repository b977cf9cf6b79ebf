//! End-to-end session runs against an in-process loopback channel standing
//! in for real clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fedmesh_core::{
    ArtifactRef, ArtifactStore, ClientChannel, ClientId, ClientRegistry, MemoryArtifactStore, Reducer, RejectReason,
    RetryPolicy, RoundTask, SelectionPolicy, SessionConfig, SessionState,
};
use tokio::sync::mpsc;
use uuid::Uuid;

struct LoopbackChannel {
    tx: mpsc::UnboundedSender<(ClientId, RoundTask)>,
}

#[async_trait]
impl ClientChannel for LoopbackChannel {
    async fn announce(&self, client: &ClientId, task: RoundTask) -> anyhow::Result<()> {
        let _ = self.tx.send((client.clone(), task));
        Ok(())
    }
}

struct Harness {
    reducer: Reducer,
    store: Arc<MemoryArtifactStore>,
    registry: Arc<ClientRegistry>,
    announcements: mpsc::UnboundedReceiver<(ClientId, RoundTask)>,
    seed: ArtifactRef,
}

fn harness_with(clients: &[&str], seed_params: Vec<f32>, liveness: Duration) -> Harness {
    let store = Arc::new(MemoryArtifactStore::new());
    let seed = store.put(seed_params);
    let registry = Arc::new(ClientRegistry::new(liveness));
    for client in clients {
        registry.heartbeat(&client.to_string());
    }
    let (tx, announcements) = mpsc::unbounded_channel();
    let reducer = Reducer::new(registry.clone(), store.clone(), Arc::new(LoopbackChannel { tx }));
    Harness {
        reducer,
        store,
        registry,
        announcements,
        seed,
    }
}

fn harness(clients: &[&str]) -> Harness {
    harness_with(clients, vec![0.0, 0.0], Duration::from_secs(10))
}

fn config(seed: ArtifactRef, rounds: u32, min_quorum: usize) -> SessionConfig {
    SessionConfig {
        aggregator: "fedavg".to_string(),
        aggregator_params: serde_json::Value::Null,
        starting_model_id: seed,
        rounds,
        round_timeout_secs: 5,
        min_quorum,
        max_participants: 100,
        combiners: 1,
        selection: SelectionPolicy::All,
        retry: RetryPolicy {
            max_retries: 0,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter: 0.0,
        },
    }
}

/// Answer every announcement with the same delta until the channel closes.
fn respond_with(
    reducer: Reducer,
    store: Arc<MemoryArtifactStore>,
    mut announcements: mpsc::UnboundedReceiver<(ClientId, RoundTask)>,
    delta: Vec<f32>,
    sample_count: u64,
    skip: usize,
) {
    tokio::spawn(async move {
        let mut seen = 0usize;
        while let Some((client, task)) = announcements.recv().await {
            seen += 1;
            if seen <= skip {
                continue;
            }
            let artifact = store.put(delta.clone());
            let _ = reducer.submit_update(task.round_id, client, artifact, sample_count);
        }
    });
}

async fn wait_for_terminal(reducer: &Reducer, session_id: &Uuid) -> SessionState {
    for _ in 0..250 {
        match reducer.status(session_id).unwrap() {
            SessionState::Finished => return SessionState::Finished,
            SessionState::Failed => return SessionState::Failed,
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("session did not reach a terminal state");
}

#[tokio::test]
async fn session_finishes_with_a_gap_free_trail() {
    let h = harness(&["a", "b", "c"]);
    let session_id = h.reducer.start_session(config(h.seed, 2, 3)).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![1.0, 2.0], 10, 0);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].round_index, 1);
    assert_eq!(trail[1].round_index, 2);
    assert_eq!(trail[0].participants, 3);
    assert_eq!(trail[1].participants, 3);
    assert_eq!(trail.iter().filter(|v| v.optimizer_step != 0).count(), 0);

    // Two rounds of an identical [1, 2] delta on a zero seed.
    let final_params = h.store.get(&trail[1].artifact).unwrap();
    assert!((final_params[0] - 2.0).abs() < 1e-5);
    assert!((final_params[1] - 4.0).abs() < 1e-5);
    assert_eq!(h.reducer.metrics().rounds_sealed, 2);
    assert_eq!(h.reducer.metrics().sessions_finished, 1);
}

#[tokio::test]
async fn unreachable_quorum_fails_the_session_without_committing() {
    // Two online clients can never satisfy a quorum of three; the round
    // fails as soon as both have responded, well before the deadline.
    let h = harness(&["a", "b"]);
    let mut cfg = config(h.seed, 3, 3);
    cfg.round_timeout_secs = 30;
    let session_id = h.reducer.start_session(cfg).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![1.0, 1.0], 1, 0);

    let started = std::time::Instant::now();
    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(h.reducer.model_trail(&session_id).unwrap().is_empty());
    assert_eq!(h.reducer.metrics().sessions_failed, 1);
}

#[tokio::test]
async fn no_online_clients_fails_the_session() {
    let h = harness(&[]);
    let session_id = h.reducer.start_session(config(h.seed, 1, 1)).unwrap();
    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Failed);
}

#[tokio::test]
async fn abort_cancels_the_in_flight_round() {
    let h = harness(&["a", "b"]);
    let mut cfg = config(h.seed, 5, 2);
    cfg.round_timeout_secs = 30;
    let session_id = h.reducer.start_session(cfg).unwrap();
    // Nobody responds; keep the announcement stream open so the round sits
    // in collection until the abort lands.
    let _announcements = h.announcements;
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.reducer.abort(&session_id).unwrap();
    let started = std::time::Instant::now();
    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(h.reducer.model_trail(&session_id).unwrap().is_empty());
    // Aborting a terminal session stays a no-op.
    h.reducer.abort(&session_id).unwrap();
    assert_eq!(h.reducer.status(&session_id).unwrap(), SessionState::Failed);
}

#[tokio::test]
async fn abort_lands_during_retry_backoff() {
    // No clients online, so the first attempt fails instantly and the
    // session sits in a long backoff sleep when the abort arrives.
    let h = harness(&[]);
    let mut cfg = config(h.seed, 3, 1);
    cfg.retry = RetryPolicy {
        max_retries: 5,
        base_delay_ms: 5_000,
        max_delay_ms: 10_000,
        jitter: 0.0,
    };
    let session_id = h.reducer.start_session(cfg).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.reducer.abort(&session_id).unwrap();
    let started = std::time::Instant::now();
    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(h.reducer.model_trail(&session_id).unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_submission_is_rejected_without_poisoning_the_round() {
    let mut h = harness(&["a", "b"]);
    let session_id = h.reducer.start_session(config(h.seed, 1, 2)).unwrap();

    let mut round = None;
    for _ in 0..2 {
        let (_, task) = h.announcements.recv().await.unwrap();
        round = Some(task.round_id);
    }
    let round_id = round.unwrap();

    let first = h.store.put(vec![1.0, 1.0]);
    h.reducer.submit_update(round_id, "a".to_string(), first, 5).unwrap();
    let second = h.store.put(vec![9.0, 9.0]);
    let err = h
        .reducer
        .submit_update(round_id, "a".to_string(), second, 5)
        .unwrap_err();
    assert_eq!(err, RejectReason::DuplicateClient);
    let zero_weight = h.store.put(vec![1.0, 1.0]);
    let err = h
        .reducer
        .submit_update(round_id, "b".to_string(), zero_weight, 0)
        .unwrap_err();
    assert_eq!(err, RejectReason::ZeroSampleCount);

    let third = h.store.put(vec![3.0, 3.0]);
    h.reducer.submit_update(round_id, "b".to_string(), third, 5).unwrap();

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail[0].participants, 2);
    // Only a's first submission counted: (1 + 3) / 2.
    let params = h.store.get(&trail[0].artifact).unwrap();
    assert!((params[0] - 2.0).abs() < 1e-5);
    assert_eq!(h.reducer.metrics().updates_rejected, 2);
}

#[tokio::test]
async fn fedadam_session_applies_an_adam_step() {
    let h = harness_with(&["a"], vec![1.0], Duration::from_secs(10));
    let mut cfg = config(h.seed, 1, 1);
    cfg.aggregator = "fedadam".to_string();
    cfg.aggregator_params = serde_json::json!({
        "learning_rate": 0.01,
        "beta1": 0.9,
        "beta2": 0.999,
        "tau": 1e-8,
    });
    let session_id = h.reducer.start_session(cfg).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![0.5], 1, 0);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].optimizer_step, 1);
    let params = h.store.get(&trail[0].artifact).unwrap();
    assert!((params[0] - 1.031_622_7).abs() < 1e-4, "got {}", params[0]);
}

#[tokio::test]
async fn failed_round_retries_and_recovers() {
    let h = harness(&["a", "b"]);
    let mut cfg = config(h.seed, 1, 2);
    cfg.round_timeout_secs = 1;
    cfg.retry = RetryPolicy {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 50,
        jitter: 0.0,
    };
    let session_id = h.reducer.start_session(cfg).unwrap();
    // Ignore the first announcement wave so the first attempt times out.
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![1.0, 1.0], 1, 2);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let metrics = h.reducer.metrics();
    assert!(metrics.rounds_failed >= 1);
    assert_eq!(metrics.rounds_sealed, 1);
    assert_eq!(h.reducer.model_trail(&session_id).unwrap().len(), 1);
}

#[tokio::test]
async fn stale_clients_are_not_selected() {
    let h = harness_with(&["stale"], vec![0.0, 0.0], Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.registry.heartbeat(&"fresh1".to_string());
    h.registry.heartbeat(&"fresh2".to_string());

    let session_id = h.reducer.start_session(config(h.seed, 1, 2)).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![1.0, 1.0], 1, 0);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail[0].participants, 2);
}

#[tokio::test]
async fn uneven_shards_still_seal_a_satisfiable_quorum() {
    // 3 clients over 2 combiners leaves a 1-client shard; the round
    // quorum of 3 must still be met once everyone responds.
    let h = harness(&["a", "b", "c"]);
    let mut cfg = config(h.seed, 1, 3);
    cfg.combiners = 2;
    let session_id = h.reducer.start_session(cfg).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![1.0, 2.0], 1, 0);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail[0].participants, 3);
}

#[tokio::test]
async fn multiple_combiner_shards_cover_the_round_quorum() {
    let h = harness(&["a", "b", "c", "d"]);
    let mut cfg = config(h.seed, 1, 4);
    cfg.combiners = 2;
    let session_id = h.reducer.start_session(cfg).unwrap();
    respond_with(h.reducer.clone(), h.store.clone(), h.announcements, vec![2.0, 0.0], 3, 0);

    assert_eq!(wait_for_terminal(&h.reducer, &session_id).await, SessionState::Finished);
    let trail = h.reducer.model_trail(&session_id).unwrap();
    assert_eq!(trail[0].participants, 4);
    let params = h.store.get(&trail[0].artifact).unwrap();
    assert!((params[0] - 2.0).abs() < 1e-5);
}
