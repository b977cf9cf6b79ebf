//! Append-only ledger of asynchronously-arriving validation metrics,
//! keyed by model version and polled by external consumers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{ClientId, ModelVersionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub model_version_id: ModelVersionId,
    pub client_id: ClientId,
    pub metrics: HashMap<String, f64>,
    pub arrived_at: DateTime<Utc>,
}

/// Safe for unlimited concurrent writers and readers. No aggregation is
/// performed here; smoothing or best-of policies belong to the caller.
#[derive(Default)]
pub struct ValidationLedger {
    records: RwLock<HashMap<ModelVersionId, Vec<ValidationRecord>>>,
}

impl ValidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model_version_id: ModelVersionId, client_id: ClientId, metrics: HashMap<String, f64>) {
        let record = ValidationRecord {
            model_version_id,
            client_id,
            metrics,
            arrived_at: Utc::now(),
        };
        debug!(model_version = %model_version_id, client = %record.client_id, "validation_recorded");
        self.records.write().entry(model_version_id).or_default().push(record);
    }

    /// Whatever has arrived so far; may be empty, never blocks.
    pub fn query(&self, model_version_id: &ModelVersionId) -> Vec<ValidationRecord> {
        self.records.read().get(model_version_id).cloned().unwrap_or_default()
    }

    pub fn records_total(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }
}
