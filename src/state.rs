use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::RagEngine;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RagEngine>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let engine = RagEngine::from_config(config, http_client)
            .context("Failed to initialise the RAG engine")?;

        Ok(Self::with_engine(Arc::new(engine)))
    }

    pub fn with_engine(engine: Arc<RagEngine>) -> Self {
        Self { engine }
    }
}
