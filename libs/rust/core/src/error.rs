use serde::Serialize;
use thiserror::Error;

use crate::model::{ArtifactRef, SessionId};

/// Rejected at session start; the session never enters `Running`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown aggregator: {0}")]
    UnknownAggregator(String),
    #[error("invalid aggregator params: {0}")]
    InvalidParams(String),
    #[error("round count must be positive")]
    NoRounds,
    #[error("min quorum must be positive")]
    NoQuorum,
    #[error("starting model {0} not found")]
    MissingSeedModel(ArtifactRef),
}

/// Numeric failure inside the pure combine step.
#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("no updates to combine")]
    NoUpdates,
    #[error("non-finite value produced during reduction")]
    NonFinite,
    #[error("delta length mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
}

/// Classified outcome of a failed round. Absorbed by the session retry
/// policy; only retry exhaustion surfaces to the session state.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("quorum not reached before deadline: {accepted}/{required}")]
    QuorumTimeout { accepted: usize, required: usize },
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("no clients available for round")]
    NoClients,
    #[error("model artifact {0} unavailable")]
    ModelUnavailable(ArtifactRef),
    #[error("round cancelled")]
    Cancelled,
    #[error("combiner task failed: {0}")]
    Task(String),
}

/// Why a submission was turned away at the boundary. The round is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("unknown or closed round")]
    UnknownRound,
    #[error("client already submitted for this round")]
    DuplicateClient,
    #[error("client was not selected for this round")]
    NotSelected,
    #[error("sample count must be positive")]
    ZeroSampleCount,
    #[error("delta artifact not resolvable")]
    MissingArtifact,
    #[error("round no longer accepting updates")]
    RoundClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
