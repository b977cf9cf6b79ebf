//! Client registry and the submission channel boundary.
//!
//! The engine never talks to a transport directly: round announcements go
//! out through the [`ClientChannel`] trait, and incoming updates are routed
//! to the open round's collection channel by the [`SubmissionRouter`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RejectReason;
use crate::metrics::EngineMetrics;
use crate::model::{ArtifactRef, ClientId, ClientUpdate, RoundId, SessionId};
use crate::storage::ArtifactStore;

/// How a round picks its participants from the online population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    All,
    /// Uniform random sample of at most `n` online clients.
    Sample(usize),
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::All
    }
}

/// A round announcement delivered to a selected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTask {
    pub session_id: SessionId,
    pub round_id: RoundId,
    pub model_id: ArtifactRef,
    pub deadline: DateTime<Utc>,
}

/// Transport boundary for outgoing announcements. Implementations must
/// carry a tamper-evident client identity; the engine does not care how.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    async fn announce(&self, client: &ClientId, task: RoundTask) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct ClientInfo {
    last_seen: DateTime<Utc>,
}

/// Tracks known clients and their liveness. A client is online if it has
/// been seen within the liveness window (heartbeat or submission).
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientInfo>>,
    liveness_window: Duration,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ClientRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            liveness_window,
        }
    }

    pub fn heartbeat(&self, client: &ClientId) {
        let mut clients = self.clients.write();
        clients
            .entry(client.clone())
            .and_modify(|c| c.last_seen = Utc::now())
            .or_insert_with(|| {
                debug!(client = %client, "client_registered");
                ClientInfo { last_seen: Utc::now() }
            });
    }

    pub fn is_online(&self, client: &ClientId) -> bool {
        let window = chrono::Duration::from_std(self.liveness_window).unwrap_or(chrono::Duration::seconds(10));
        self.clients
            .read()
            .get(client)
            .map(|c| Utc::now() - c.last_seen < window)
            .unwrap_or(false)
    }

    pub fn online_clients(&self) -> Vec<ClientId> {
        let window = chrono::Duration::from_std(self.liveness_window).unwrap_or(chrono::Duration::seconds(10));
        let now = Utc::now();
        let mut online: Vec<ClientId> = self
            .clients
            .read()
            .iter()
            .filter(|(_, c)| now - c.last_seen < window)
            .map(|(id, _)| id.clone())
            .collect();
        online.sort();
        online
    }

    /// Apply the selection policy to the online population, capped at
    /// `max_participants`.
    pub fn select(&self, policy: &SelectionPolicy, max_participants: usize) -> Vec<ClientId> {
        let online = self.online_clients();
        let mut selected = match policy {
            SelectionPolicy::All => online,
            SelectionPolicy::Sample(n) => {
                let mut rng = rand::thread_rng();
                online.choose_multiple(&mut rng, *n).cloned().collect()
            }
        };
        if max_participants > 0 && selected.len() > max_participants {
            selected.truncate(max_participants);
        }
        selected
    }
}

struct ShardSlot {
    clients: HashSet<ClientId>,
    tx: mpsc::Sender<ClientUpdate>,
}

/// Per-round routing state: shard channels plus the shared accepted set
/// used for duplicate detection across shards.
pub struct RoundInbox {
    round_id: RoundId,
    shards: Vec<ShardSlot>,
    accepted: Mutex<HashSet<ClientId>>,
}

impl RoundInbox {
    /// Build the inbox for a round, returning one receiver per shard in
    /// shard order.
    pub fn new(round_id: RoundId, shards: &[Vec<ClientId>]) -> (Arc<Self>, Vec<mpsc::Receiver<ClientUpdate>>) {
        let mut slots = Vec::with_capacity(shards.len());
        let mut receivers = Vec::with_capacity(shards.len());
        for clients in shards {
            let (tx, rx) = mpsc::channel(clients.len().max(1));
            slots.push(ShardSlot {
                clients: clients.iter().cloned().collect(),
                tx,
            });
            receivers.push(rx);
        }
        let inbox = Arc::new(Self {
            round_id,
            shards: slots,
            accepted: Mutex::new(HashSet::new()),
        });
        (inbox, receivers)
    }

    fn shard_for(&self, client: &ClientId) -> Option<&ShardSlot> {
        self.shards.iter().find(|s| s.clients.contains(client))
    }
}

/// Routes submissions to the open round that owns them. Validation happens
/// here, synchronously, so the submitter gets a definitive accept/reject.
pub struct SubmissionRouter {
    rounds: RwLock<HashMap<RoundId, Arc<RoundInbox>>>,
    store: Arc<dyn ArtifactStore>,
    metrics: Arc<EngineMetrics>,
}

impl SubmissionRouter {
    pub fn new(store: Arc<dyn ArtifactStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            store,
            metrics,
        }
    }

    pub fn open_round(&self, inbox: Arc<RoundInbox>) {
        self.rounds.write().insert(inbox.round_id, inbox);
    }

    pub fn close_round(&self, round_id: &RoundId) {
        self.rounds.write().remove(round_id);
    }

    /// Validate and route one incoming update. Rejects are logged and leave
    /// the round untouched.
    pub fn submit(&self, update: ClientUpdate) -> Result<(), RejectReason> {
        let res = self.route(update);
        match res {
            Ok(()) => EngineMetrics::incr(&self.metrics.updates_accepted),
            Err(reason) => {
                EngineMetrics::incr(&self.metrics.updates_rejected);
                debug!(reason = %reason, "update_rejected");
            }
        }
        res
    }

    fn route(&self, update: ClientUpdate) -> Result<(), RejectReason> {
        let inbox = self
            .rounds
            .read()
            .get(&update.round_id)
            .cloned()
            .ok_or(RejectReason::UnknownRound)?;
        if update.sample_count == 0 {
            return Err(RejectReason::ZeroSampleCount);
        }
        if !self.store.contains(&update.delta) {
            return Err(RejectReason::MissingArtifact);
        }
        let shard = inbox.shard_for(&update.client_id).ok_or(RejectReason::NotSelected)?;
        {
            let mut accepted = inbox.accepted.lock();
            if !accepted.insert(update.client_id.clone()) {
                return Err(RejectReason::DuplicateClient);
            }
        }
        // A full or closed channel means the shard already stopped
        // collecting; the straggler is dropped, not queued.
        shard.tx.try_send(update).map_err(|_| RejectReason::RoundClosed)
    }
}
