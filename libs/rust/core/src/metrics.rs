//! Lightweight engine counters, polled as a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub updates_accepted: AtomicU64,
    pub updates_rejected: AtomicU64,
    pub rounds_sealed: AtomicU64,
    pub rounds_failed: AtomicU64,
    pub sessions_finished: AtomicU64,
    pub sessions_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub updates_accepted: u64,
    pub updates_rejected: u64,
    pub rounds_sealed: u64,
    pub rounds_failed: u64,
    pub sessions_finished: u64,
    pub sessions_failed: u64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            updates_accepted: self.updates_accepted.load(Ordering::Relaxed),
            updates_rejected: self.updates_rejected.load(Ordering::Relaxed),
            rounds_sealed: self.rounds_sealed.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            sessions_finished: self.sessions_finished.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
