//! Round coordinator: announces a round to its client shard, collects
//! submissions under the quorum/deadline race, and seals a weighted partial.
//!
//! Phase machine: Pending -> Collecting -> Aggregating -> Sealed, or Failed
//! when the deadline beats quorum, the numeric reduce fails, or the session
//! is cancelled mid-collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::aggregation::{self, AggregationMethod, AggregatorState, WeightedDelta};
use crate::error::RoundError;
use crate::model::{ArtifactRef, ClientId, ClientUpdate, RoundId, SessionId};
use crate::registry::{ClientChannel, RoundTask};
use crate::storage::ArtifactStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Pending,
    Collecting,
    Aggregating,
    Sealed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub session_id: SessionId,
    pub round_id: RoundId,
    pub base_model: ArtifactRef,
    pub timeout: Duration,
    pub min_quorum: usize,
}

/// A sealed shard's contribution: the weighted average of its accepted
/// deltas, carrying the summed sample count so shard partials can be
/// combined again at the session level.
#[derive(Debug, Clone)]
pub struct CombinerResult {
    pub partial: WeightedDelta,
    pub participants: usize,
}

pub struct Combiner {
    config: RoundConfig,
    clients: Vec<ClientId>,
    rx: mpsc::Receiver<ClientUpdate>,
    store: Arc<dyn ArtifactStore>,
    channel: Arc<dyn ClientChannel>,
    cancel: watch::Receiver<bool>,
}

impl Combiner {
    pub fn new(
        config: RoundConfig,
        clients: Vec<ClientId>,
        rx: mpsc::Receiver<ClientUpdate>,
        store: Arc<dyn ArtifactStore>,
        channel: Arc<dyn ClientChannel>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            clients,
            rx,
            store,
            channel,
            cancel,
        }
    }

    /// Drive the round to completion. Consumes the combiner; a round is
    /// discarded after its outcome is reported.
    pub async fn run(self) -> Result<CombinerResult, RoundError> {
        let Combiner {
            config,
            clients,
            mut rx,
            store,
            channel,
            mut cancel,
        } = self;
        let selected = clients.len();
        let quorum = config.min_quorum;

        // Pending -> Collecting: announce to the shard. An unreachable
        // client is not an error; it just cannot contribute this round.
        let deadline = Utc::now()
            + chrono::Duration::from_std(config.timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let task = RoundTask {
            session_id: config.session_id,
            round_id: config.round_id,
            model_id: config.base_model,
            deadline,
        };
        for client in &clients {
            if let Err(e) = channel.announce(client, task.clone()).await {
                warn!(round_id = %config.round_id, client = %client, error = %e, "announce_failed");
            }
        }
        debug!(
            round_id = %config.round_id,
            phase = ?RoundPhase::Collecting,
            selected,
            quorum,
            "round_collecting"
        );

        let mut accepted: Vec<WeightedDelta> = Vec::with_capacity(selected);
        let timer = tokio::time::sleep(config.timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(update) = maybe else {
                        // Inbox torn down under us; only happens on teardown.
                        return Err(RoundError::Cancelled);
                    };
                    match store.get(&update.delta) {
                        Some(delta) => {
                            accepted.push(WeightedDelta { delta, weight: update.sample_count });
                            debug!(
                                round_id = %config.round_id,
                                client = %update.client_id,
                                accepted = accepted.len(),
                                "update_accepted"
                            );
                            // Quorum met, or every selected participant has
                            // responded: stop collecting either way.
                            if accepted.len() >= quorum || accepted.len() == selected {
                                break;
                            }
                        }
                        None => {
                            warn!(round_id = %config.round_id, client = %update.client_id, "delta_unresolvable");
                        }
                    }
                }
                _ = &mut timer => {
                    warn!(
                        round_id = %config.round_id,
                        phase = ?RoundPhase::Failed,
                        accepted = accepted.len(),
                        required = quorum,
                        "round_deadline_expired"
                    );
                    return Err(RoundError::QuorumTimeout { accepted: accepted.len(), required: quorum });
                }
                _ = cancelled(&mut cancel) => {
                    warn!(round_id = %config.round_id, phase = ?RoundPhase::Failed, "round_cancelled");
                    return Err(RoundError::Cancelled);
                }
            }
        }

        if accepted.len() < quorum {
            // Whole shard responded but quorum is unreachable.
            return Err(RoundError::QuorumTimeout {
                accepted: accepted.len(),
                required: quorum,
            });
        }

        debug!(round_id = %config.round_id, phase = ?RoundPhase::Aggregating, "round_aggregating");
        let weight: u64 = accepted.iter().map(|u| u.weight).sum();
        let (delta, _) = aggregation::combine(&AggregationMethod::WeightedAverage, &accepted, AggregatorState::Stateless)?;
        info!(
            round_id = %config.round_id,
            phase = ?RoundPhase::Sealed,
            participants = accepted.len(),
            "combiner_sealed"
        );
        Ok(CombinerResult {
            partial: WeightedDelta { delta, weight },
            participants: accepted.len(),
        })
    }
}

/// Resolves when the session cancel flag flips to true; pends forever if
/// cancellation can no longer happen.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
