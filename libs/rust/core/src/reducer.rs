//! Session orchestrator: owns session lifecycle and the model trail, drives
//! the round sequence, and threads aggregator state through rounds.
//!
//! The round loop is the engine's single serialization point. Round k+1
//! never starts collecting before round k's version is committed, because
//! the optimizer state is single-writer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregation::{self, AggregationMethod, AggregatorState};
use crate::combiner::{Combiner, RoundConfig};
use crate::error::{AggregateError, ConfigError, RejectReason, RoundError, SessionError};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::model::{ArtifactRef, ClientId, ClientUpdate, ModelVersion, SessionConfig, SessionId, SessionState};
use crate::registry::{ClientChannel, ClientRegistry, RoundInbox, SubmissionRouter};
use crate::storage::ArtifactStore;

struct Session {
    state: SessionState,
    trail: Vec<ModelVersion>,
    cancel: watch::Sender<bool>,
}

struct ReducerInner {
    sessions: RwLock<HashMap<SessionId, Session>>,
    registry: Arc<ClientRegistry>,
    store: Arc<dyn ArtifactStore>,
    channel: Arc<dyn ClientChannel>,
    router: SubmissionRouter,
    metrics: Arc<EngineMetrics>,
}

#[derive(Clone)]
pub struct Reducer {
    inner: Arc<ReducerInner>,
}

impl Reducer {
    pub fn new(registry: Arc<ClientRegistry>, store: Arc<dyn ArtifactStore>, channel: Arc<dyn ClientChannel>) -> Self {
        let metrics = Arc::new(EngineMetrics::default());
        let router = SubmissionRouter::new(store.clone(), metrics.clone());
        Self {
            inner: Arc::new(ReducerInner {
                sessions: RwLock::new(HashMap::new()),
                registry,
                store,
                channel,
                router,
                metrics,
            }),
        }
    }

    /// Validate the config and launch the round loop. Returns as soon as the
    /// session id is allocated; rounds proceed asynchronously.
    pub fn start_session(&self, config: SessionConfig) -> Result<SessionId, SessionError> {
        if config.rounds == 0 {
            return Err(ConfigError::NoRounds.into());
        }
        if config.min_quorum == 0 {
            return Err(ConfigError::NoQuorum.into());
        }
        let method = AggregationMethod::from_config(&config.aggregator, &config.aggregator_params)?;
        if !self.inner.store.contains(&config.starting_model_id) {
            return Err(ConfigError::MissingSeedModel(config.starting_model_id).into());
        }

        let session_id = Uuid::new_v4();
        let (cancel, _) = watch::channel(false);
        self.inner.sessions.write().insert(
            session_id,
            Session {
                state: SessionState::Created,
                trail: Vec::new(),
                cancel: cancel.clone(),
            },
        );
        info!(session_id = %session_id, aggregator = %config.aggregator, rounds = config.rounds, "session_started");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_session(inner, session_id, config, method, cancel).await;
        });
        Ok(session_id)
    }

    pub fn status(&self, session_id: &SessionId) -> Result<SessionState, SessionError> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.state)
            .ok_or(SessionError::UnknownSession(*session_id))
    }

    /// Snapshot of the committed model trail; its length equals the number
    /// of sealed rounds so far.
    pub fn model_trail(&self, session_id: &SessionId) -> Result<Vec<ModelVersion>, SessionError> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.trail.clone())
            .ok_or(SessionError::UnknownSession(*session_id))
    }

    /// Cancel any in-flight round and fail the session. No partial round is
    /// ever committed. A no-op on already-terminal sessions.
    pub fn abort(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let sessions = self.inner.sessions.read();
        let session = sessions.get(session_id).ok_or(SessionError::UnknownSession(*session_id))?;
        if matches!(session.state, SessionState::Created | SessionState::Running) {
            warn!(session_id = %session_id, "session_abort_requested");
            // send_replace sets the flag even when no combiner currently
            // holds a subscription (between rounds, during commit, or in
            // the retry backoff sleep).
            session.cancel.send_replace(true);
        }
        Ok(())
    }

    /// Route one client submission to the round that owns it. Also counts
    /// as client liveness, the same way a heartbeat does.
    pub fn submit_update(
        &self,
        round_id: Uuid,
        client_id: ClientId,
        delta: ArtifactRef,
        sample_count: u64,
    ) -> Result<(), RejectReason> {
        self.inner.registry.heartbeat(&client_id);
        self.inner
            .router
            .submit(ClientUpdate::new(round_id, client_id, delta, sample_count))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

async fn run_session(
    inner: Arc<ReducerInner>,
    session_id: SessionId,
    config: SessionConfig,
    method: AggregationMethod,
    cancel: watch::Sender<bool>,
) {
    set_state(&inner, session_id, SessionState::Running);
    let mut state = method.initial_state();
    let mut base = config.starting_model_id;

    for round_index in 1..=config.rounds {
        let mut attempt: u32 = 0;
        loop {
            if *cancel.borrow() {
                fail_session(&inner, session_id, "aborted");
                return;
            }
            match run_round(&inner, session_id, round_index, base, &config, &method, state.clone(), &cancel).await {
                Ok((version, next_state)) => {
                    EngineMetrics::incr(&inner.metrics.rounds_sealed);
                    info!(
                        session_id = %session_id,
                        round = round_index,
                        model_version = %version.id,
                        participants = version.participants,
                        "round_sealed"
                    );
                    base = version.artifact;
                    state = next_state;
                    push_version(&inner, session_id, version);
                    break;
                }
                Err(RoundError::Cancelled) => {
                    EngineMetrics::incr(&inner.metrics.rounds_failed);
                    fail_session(&inner, session_id, "aborted");
                    return;
                }
                Err(e) => {
                    EngineMetrics::incr(&inner.metrics.rounds_failed);
                    warn!(session_id = %session_id, round = round_index, attempt, error = %e, "round_failed");
                    if attempt >= config.retry.max_retries {
                        fail_session(&inner, session_id, "retries exhausted");
                        return;
                    }
                    let mut cancel_rx = cancel.subscribe();
                    tokio::select! {
                        _ = tokio::time::sleep(config.retry.delay(attempt)) => {}
                        _ = cancel_rx.wait_for(|aborted| *aborted) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    EngineMetrics::incr(&inner.metrics.sessions_finished);
    set_state(&inner, session_id, SessionState::Finished);
    info!(session_id = %session_id, rounds = config.rounds, "session_finished");
}

/// Execute one round: shard the selected clients across combiners, run them
/// concurrently, combine shard partials with the session strategy, and
/// commit the new model version.
#[allow(clippy::too_many_arguments)]
async fn run_round(
    inner: &Arc<ReducerInner>,
    session_id: SessionId,
    round_index: u32,
    base: ArtifactRef,
    config: &SessionConfig,
    method: &AggregationMethod,
    prior: AggregatorState,
    cancel: &watch::Sender<bool>,
) -> Result<(ModelVersion, AggregatorState), RoundError> {
    let selected = inner.registry.select(&config.selection, config.max_participants);
    if selected.is_empty() {
        return Err(RoundError::NoClients);
    }
    // Never more shards than the quorum, so every shard carries a
    // positive share of it.
    let shard_count = config.combiners.max(1).min(selected.len()).min(config.min_quorum);
    let mut shards: Vec<Vec<ClientId>> = vec![Vec::new(); shard_count];
    for (i, client) in selected.iter().enumerate() {
        shards[i % shard_count].push(client.clone());
    }
    let shard_sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
    let shard_quorums = apportion_quorum(config.min_quorum, &shard_sizes);

    let round_id = Uuid::new_v4();
    let (inbox, receivers) = RoundInbox::new(round_id, &shards);
    inner.router.open_round(inbox);
    debug!(
        session_id = %session_id,
        round = round_index,
        round_id = %round_id,
        selected = selected.len(),
        shards = shard_count,
        "round_started"
    );

    let mut handles = Vec::with_capacity(shard_count);
    for ((clients, rx), shard_quorum) in shards.into_iter().zip(receivers).zip(shard_quorums) {
        let combiner = Combiner::new(
            RoundConfig {
                session_id,
                round_id,
                base_model: base,
                timeout: config.round_timeout(),
                min_quorum: shard_quorum,
            },
            clients,
            rx,
            inner.store.clone(),
            inner.channel.clone(),
            cancel.subscribe(),
        );
        handles.push(tokio::spawn(combiner.run()));
    }

    let mut partials = Vec::with_capacity(shard_count);
    let mut participants = 0;
    let mut errors: Vec<RoundError> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(result)) => {
                participants += result.participants;
                partials.push(result.partial);
            }
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(RoundError::Task(e.to_string())),
        }
    }
    inner.router.close_round(&round_id);

    if !errors.is_empty() {
        // Abort beats any other classification.
        let idx = errors.iter().position(|e| matches!(e, RoundError::Cancelled)).unwrap_or(0);
        return Err(errors.swap_remove(idx));
    }
    // Shard quotas are capped by shard size, so the round quorum is held
    // here, over the summed participant count.
    if participants < config.min_quorum {
        return Err(RoundError::QuorumTimeout {
            accepted: participants,
            required: config.min_quorum,
        });
    }

    let (delta, next_state) = aggregation::combine(method, &partials, prior)?;
    let base_params = inner.store.get(&base).ok_or(RoundError::ModelUnavailable(base))?;
    if base_params.len() != delta.len() {
        return Err(RoundError::Aggregate(AggregateError::ShapeMismatch {
            expected: base_params.len(),
            got: delta.len(),
        }));
    }
    let next_params: Vec<f32> = base_params.iter().zip(&delta).map(|(theta, d)| theta + d).collect();
    if !next_params.iter().all(|x| x.is_finite()) {
        return Err(RoundError::Aggregate(AggregateError::NonFinite));
    }

    let artifact = inner.store.put(next_params);
    let version = ModelVersion {
        id: Uuid::new_v4(),
        round_index,
        artifact,
        participants,
        optimizer_step: next_state.step(),
        committed_at: Utc::now(),
    };
    Ok((version, next_state))
}

/// Split the round quorum across shards, capping every quota at its
/// shard's size. Quotas sum to `quorum` whenever the selected population
/// covers it; a shortfall surfaces as a round-level quorum failure after
/// all shards have sealed.
fn apportion_quorum(quorum: usize, shard_sizes: &[usize]) -> Vec<usize> {
    let mut quotas = vec![0usize; shard_sizes.len()];
    let mut remaining = quorum;
    for (i, &size) in shard_sizes.iter().enumerate() {
        let shards_left = shard_sizes.len() - i;
        let share = (remaining + shards_left - 1) / shards_left;
        quotas[i] = share.min(size);
        remaining = remaining.saturating_sub(quotas[i]);
    }
    // Push any capped-off remainder onto shards with slack.
    for (i, &size) in shard_sizes.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let extra = (size - quotas[i]).min(remaining);
        quotas[i] += extra;
        remaining -= extra;
    }
    quotas
}

fn set_state(inner: &ReducerInner, session_id: SessionId, state: SessionState) {
    if let Some(session) = inner.sessions.write().get_mut(&session_id) {
        session.state = state;
    }
}

fn push_version(inner: &ReducerInner, session_id: SessionId, version: ModelVersion) {
    if let Some(session) = inner.sessions.write().get_mut(&session_id) {
        session.trail.push(version);
    }
}

fn fail_session(inner: &ReducerInner, session_id: SessionId, reason: &str) {
    EngineMetrics::incr(&inner.metrics.sessions_failed);
    warn!(session_id = %session_id, reason, "session_failed");
    set_state(inner, session_id, SessionState::Failed);
}
