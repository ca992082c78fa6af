use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};

/// Maximum characters to send per text to the embedding API.
/// Chunks are far below this; it only guards pathological questions.
const MAX_EMBED_CHARS: usize = 3_000;

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    // Find the last char boundary at or before the limit
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Anything that turns text into a vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedding client for Ollama or OpenAI-compatible APIs.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_for_embedding(text);
        match self.config.provider.as_str() {
            "ollama" => embed_ollama(&self.client, &self.config, text).await,
            "openai" => embed_openai(&self.client, &self.config, text).await,
            other => Err(RagError::Config(format!("Unknown LLM provider: {other}"))),
        }
    }
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    /// Ask Ollama to silently truncate inputs that exceed the model's context
    /// length instead of returning a 400 error.
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

async fn embed_ollama(client: &reqwest::Client, config: &LlmConfig, text: &str) -> Result<Vec<f32>> {
    let url = format!("{}/api/embed", config.base_url);
    let req = OllamaEmbedRequest {
        model: &config.embedding_model,
        input: vec![text],
        truncate: true,
    };

    let resp = client
        .post(&url)
        .json(&req)
        .send()
        .await
        .map_err(|e| RagError::Embedding(format!("Failed to call Ollama embed API: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(RagError::Embedding(format!(
            "Ollama embed API returned {status}: {body}"
        )));
    }

    let body: OllamaEmbedResponse = resp
        .json()
        .await
        .map_err(|e| RagError::Embedding(format!("Failed to parse Ollama embed response: {e}")))?;

    body.embeddings
        .into_iter()
        .next()
        .ok_or_else(|| RagError::Embedding("No embedding returned".into()))
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    embedding: Vec<f32>,
}

async fn embed_openai(client: &reqwest::Client, config: &LlmConfig, text: &str) -> Result<Vec<f32>> {
    let url = format!("{}/v1/embeddings", config.base_url);
    let api_key = config.api_key.as_deref().unwrap_or_default();

    let req = OpenAiEmbedRequest {
        model: &config.embedding_model,
        input: text,
    };

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&req)
        .send()
        .await
        .map_err(|e| RagError::Embedding(format!("Failed to call OpenAI embed API: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(RagError::Embedding(format!(
            "OpenAI embed API returned {status}: {body}"
        )));
    }

    let body: OpenAiEmbedResponse = resp
        .json()
        .await
        .map_err(|e| RagError::Embedding(format!("Failed to parse OpenAI embed response: {e}")))?;

    body.data
        .into_iter()
        .next()
        .map(|d| d.embedding)
        .ok_or_else(|| RagError::Embedding("No embedding returned".into()))
}

// ─── Gateway ─────────────────────────────────────────────

/// Throttled front door to an [`Embedder`].
///
/// At most `max_concurrent` calls are in flight; the permit is released when
/// the call finishes whether it succeeded or not. The first good vector fixes
/// the dimension for the life of the gateway.
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    permits: Arc<Semaphore>,
    dimension: OnceLock<usize>,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, max_concurrent: usize) -> Self {
        Self {
            embedder,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            dimension: OnceLock::new(),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| RagError::Embedding("embedding pool is closed".into()))?;
            self.embedder.embed(text).await?
        };

        if vector.len() <= 1 {
            return Err(RagError::Embedding(format!(
                "implausible embedding of {} dimension(s)",
                vector.len()
            )));
        }

        let expected = *self.dimension.get_or_init(|| {
            tracing::info!("Detected embedding dimension {}", vector.len());
            vector.len()
        });
        if vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        Ok(vector)
    }

    /// Dimension discovered by the first successful call, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
