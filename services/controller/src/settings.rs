use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub liveness_window_secs: u64,
}

impl Settings {
    /// Defaults, overlaid by an optional config file (`FEDMESH_CONFIG_FILE`)
    /// and `FEDMESH__*` environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("bind_addr", "0.0.0.0:8080")?
            .set_default("liveness_window_secs", 10u64)?;

        if let Ok(file) = std::env::var("FEDMESH_CONFIG_FILE") {
            let path = PathBuf::from(&file);
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("FEDMESH").separator("__"));

        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}
