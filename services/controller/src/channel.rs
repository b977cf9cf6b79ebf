//! Pull-based client channel: announcements land in per-client task queues
//! that clients drain by polling, so no inbound connectivity to clients is
//! required.

use std::collections::HashMap;

use async_trait::async_trait;
use fedmesh_core::{ClientChannel, ClientId, RoundTask};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct TaskQueueChannel {
    queues: RwLock<HashMap<ClientId, Vec<RoundTask>>>,
}

impl TaskQueueChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out and clear everything queued for this client.
    pub fn drain(&self, client: &ClientId) -> Vec<RoundTask> {
        self.queues.write().remove(client).unwrap_or_default()
    }
}

#[async_trait]
impl ClientChannel for TaskQueueChannel {
    async fn announce(&self, client: &ClientId, task: RoundTask) -> anyhow::Result<()> {
        debug!(client = %client, round_id = %task.round_id, "task_queued");
        self.queues.write().entry(client.clone()).or_default().push(task);
        Ok(())
    }
}
