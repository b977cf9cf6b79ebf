//! Core engine for tiered federated model aggregation.
//!
//! A session runs a fixed number of rounds. Each round fans the current
//! model out to a selection of clients, collects weighted parameter deltas
//! under a quorum/deadline race, reduces shard partials into one update,
//! and commits the next model version to the session trail.

pub mod aggregation;
pub mod combiner;
pub mod error;
pub mod metrics;
pub mod model;
pub mod reducer;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod validation;

pub use aggregation::{AggregationMethod, AggregatorState, FedAdamParams, WeightedDelta};
pub use combiner::{Combiner, CombinerResult, RoundConfig, RoundPhase};
pub use error::{AggregateError, ConfigError, RejectReason, RoundError, SessionError};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use model::{
    ArtifactRef, ClientId, ClientUpdate, ModelVersion, ModelVersionId, RoundId, SessionConfig, SessionId, SessionState,
};
pub use reducer::Reducer;
pub use registry::{ClientChannel, ClientRegistry, RoundTask, SelectionPolicy, SubmissionRouter};
pub use retry::RetryPolicy;
pub use storage::{ArtifactStore, MemoryArtifactStore};
pub use validation::{ValidationLedger, ValidationRecord};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
