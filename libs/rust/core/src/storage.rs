//! Artifact store boundary. The engine only ever handles opaque refs;
//! blob persistence lives outside the core.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::ArtifactRef;

pub trait ArtifactStore: Send + Sync {
    /// Store a parameter vector and return its handle.
    fn put(&self, params: Vec<f32>) -> ArtifactRef;
    /// Fetch a stored parameter vector, if present.
    fn get(&self, id: &ArtifactRef) -> Option<Vec<f32>>;
    fn contains(&self, id: &ArtifactRef) -> bool;
}

/// In-memory store. Backs tests and the default controller deployment;
/// published artifacts are immutable once inserted.
#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: RwLock<HashMap<ArtifactRef, Arc<Vec<f32>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, params: Vec<f32>) -> ArtifactRef {
        let id = Uuid::new_v4();
        self.inner.write().insert(id, Arc::new(params));
        id
    }

    fn get(&self, id: &ArtifactRef) -> Option<Vec<f32>> {
        self.inner.read().get(id).map(|p| p.as_ref().clone())
    }

    fn contains(&self, id: &ArtifactRef) -> bool {
        self.inner.read().contains_key(id)
    }
}
