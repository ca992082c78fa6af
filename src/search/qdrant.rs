//! Qdrant REST client implementing [`VectorStore`].
//!
//! The collection is created lazily with cosine distance, sized from the
//! first vector that reaches the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::vector::{ChunkPayload, VectorPoint, VectorStore};
use crate::config::VectorStoreConfig;
use crate::error::{RagError, Result};
use crate::models::SearchHit;

const UPSERT_TIMEOUT: Duration = Duration::from_secs(60);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    ready: OnceCell<usize>,
}

impl QdrantStore {
    pub fn new(client: reqwest::Client, config: &VectorStoreConfig) -> Self {
        Self {
            client,
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            ready: OnceCell::new(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    /// Make sure the collection exists and matches `dim`.
    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        let size = *self
            .ready
            .get_or_try_init(|| self.create_if_missing(dim))
            .await?;
        if size != dim {
            return Err(RagError::DimensionMismatch {
                expected: size,
                actual: dim,
            });
        }
        Ok(())
    }

    async fn create_if_missing(&self, dim: usize) -> Result<usize> {
        let url = self.collection_url();
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to reach Qdrant: {e}")))?;

        if resp.status().is_success() {
            let info: CollectionInfoResponse = resp
                .json()
                .await
                .map_err(|e| RagError::Retrieval(format!("Failed to parse collection info: {e}")))?;
            let size = info.vector_size().unwrap_or(dim);
            tracing::info!("Using existing Qdrant collection '{}' ({size} dims)", self.collection);
            return Ok(size);
        }

        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Retrieval(format!(
                "Qdrant collection lookup returned {status}: {body}"
            )));
        }

        let body = json!({ "vectors": { "size": dim, "distance": "Cosine" } });
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to create Qdrant collection: {e}")))?;
        check_status(resp, "create collection").await?;

        tracing::info!("Created Qdrant collection '{}' ({dim} dims)", self.collection);
        Ok(dim)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        let dim = first.vector.len();
        self.ensure_collection(dim).await?;

        if let Some(bad) = points.iter().find(|p| p.vector.len() != dim) {
            return Err(RagError::DimensionMismatch {
                expected: dim,
                actual: bad.vector.len(),
            });
        }

        let body = UpsertRequest {
            points: points
                .into_iter()
                .map(|p| PointStruct {
                    id: p.id,
                    vector: p.vector,
                    payload: p.payload,
                })
                .collect(),
        };

        let resp = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .timeout(UPSERT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to upsert points: {e}")))?;
        check_status(resp, "upsert").await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        self.ensure_collection(vector.len()).await?;

        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(cat) = category {
            body["filter"] = json!({ "must": [{ "key": "categories", "match": { "any": [cat] } }] });
        }

        let resp = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .timeout(SEARCH_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to search Qdrant: {e}")))?;
        let resp = check_status(resp, "search").await?;

        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to parse Qdrant search response: {e}")))?;

        Ok(parsed
            .result
            .into_iter()
            .filter_map(|p| {
                let payload = p.payload?;
                Some(payload.into_hit(p.id.to_string(), p.score))
            })
            .collect())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let body = json!({ "filter": { "must": [{ "key": "docId", "match": { "value": doc_id } }] } });
        let resp = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .timeout(UPSERT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to delete points: {e}")))?;

        // Nothing to delete before the collection exists
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(resp, "delete").await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let resp = self
            .client
            .post(format!("{}/points/count", self.collection_url()))
            .timeout(SEARCH_TIMEOUT)
            .json(&json!({ "exact": true }))
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to count points: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let resp = check_status(resp, "count").await?;
        let parsed: CountResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to parse count response: {e}")))?;
        Ok(parsed.result.count)
    }
}

async fn check_status(resp: reqwest::Response, op: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(RagError::Retrieval(format!("Qdrant {op} returned {status}: {body}")))
}

// ─── Request/Response types ────────────────────────────

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<PointStruct>,
}

#[derive(Serialize)]
struct PointStruct {
    id: String,
    vector: Vec<f32>,
    payload: ChunkPayload,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: PointId,
    score: f32,
    payload: Option<ChunkPayload>,
}

/// Qdrant ids are either UUID strings or unsigned integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum PointId {
    Uuid(String),
    Num(u64),
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointId::Uuid(s) => f.write_str(s),
            PointId::Num(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: serde_json::Value,
}

impl CollectionInfoResponse {
    /// `result.config.params.vectors.size` for a single unnamed vector.
    fn vector_size(&self) -> Option<usize> {
        self.result
            .pointer("/config/params/vectors/size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}
