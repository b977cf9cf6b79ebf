use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fedmesh_core::{ClientRegistry, MemoryArtifactStore, Reducer, ValidationLedger};
use tracing::info;

mod api;
mod channel;
mod settings;

use api::AppState;
use channel::TaskQueueChannel;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    fedmesh_core::init_tracing();
    let settings = Settings::load()?;
    info!(target: "controller", bind_addr = %settings.bind_addr, "Starting controller service");

    let registry = Arc::new(ClientRegistry::new(Duration::from_secs(settings.liveness_window_secs)));
    let store = Arc::new(MemoryArtifactStore::new());
    let tasks = Arc::new(TaskQueueChannel::new());
    let reducer = Reducer::new(registry.clone(), store.clone(), tasks.clone());

    let state = AppState {
        reducer,
        registry,
        ledger: Arc::new(ValidationLedger::new()),
        tasks,
        store,
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
