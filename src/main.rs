use anyhow::Context;
use tracing_subscriber::EnvFilter;

use rag_service::api;
use rag_service::config::Config;
use rag_service::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    tracing::info!(
        "Vector store: {:?} ({}), reranker: {:?}",
        config.vector_store.kind,
        config.vector_store.qdrant_url,
        config.reranker.provider
    );

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config)?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!("Server listening on {bind_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
