//! Core data model for sessions, rounds, model versions and client updates.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::SelectionPolicy;
use crate::retry::RetryPolicy;

pub type SessionId = Uuid;
pub type RoundId = Uuid;
pub type ModelVersionId = Uuid;
/// Opaque handle to a model or delta artifact held by an [`crate::storage::ArtifactStore`].
pub type ArtifactRef = Uuid;
pub type ClientId = String;

/// Lifecycle of a training session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Created,
    Running,
    Finished,
    Failed,
}

/// Configuration supplied when starting a session.
///
/// `aggregator` + `aggregator_params` are resolved against the closed
/// strategy registry at start; an unknown name never enters `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub aggregator: String,
    #[serde(default)]
    pub aggregator_params: serde_json::Value,
    pub starting_model_id: ArtifactRef,
    pub rounds: u32,
    #[serde(default = "default_round_timeout_secs")]
    pub round_timeout_secs: u64,
    #[serde(default = "default_min_quorum")]
    pub min_quorum: usize,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    /// Number of round coordinators the selected clients are sharded across.
    #[serde(default = "default_combiners")]
    pub combiners: usize,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_round_timeout_secs() -> u64 {
    60
}

fn default_min_quorum() -> usize {
    1
}

fn default_max_participants() -> usize {
    100
}

fn default_combiners() -> usize {
    1
}

impl SessionConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }
}

/// One committed entry of a session's model trail. Never mutated after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: ModelVersionId,
    /// Round index within the session, strictly increasing and gap-free.
    pub round_index: u32,
    pub artifact: ArtifactRef,
    pub participants: usize,
    /// Optimizer step counter snapshot at commit time (0 for stateless strategies).
    pub optimizer_step: u64,
    pub committed_at: DateTime<Utc>,
}

/// A client's contribution to one round. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub round_id: RoundId,
    pub client_id: ClientId,
    pub delta: ArtifactRef,
    pub sample_count: u64,
    pub submitted_at: DateTime<Utc>,
}

impl ClientUpdate {
    pub fn new(round_id: RoundId, client_id: ClientId, delta: ArtifactRef, sample_count: u64) -> Self {
        Self {
            round_id,
            client_id,
            delta,
            sample_count,
            submitted_at: Utc::now(),
        }
    }
}
