use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{RagError, Result};
use crate::models::{Chunk, SearchHit};

/// Payload stored next to every vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl From<&Chunk> for ChunkPayload {
    fn from(chunk: &Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
            categories: chunk.categories.clone(),
            title: chunk.title.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

impl ChunkPayload {
    pub fn into_hit(self, id: String, score: f32) -> SearchHit {
        SearchHit {
            id,
            doc_id: self.doc_id,
            chunk_index: self.chunk_index,
            text: self.text,
            title: self.title,
            score,
        }
    }
}

/// Approximate nearest-neighbour store for chunk embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite points by id.
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()>;

    /// Nearest points by cosine similarity, best first, optionally limited to
    /// points whose `categories` contain `category`.
    async fn search(&self, vector: &[f32], limit: usize, category: Option<&str>)
        -> Result<Vec<SearchHit>>;

    /// Remove every point of a document.
    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// Dense retrieval over a [`VectorStore`] with size-bounded writes.
pub struct DenseRetriever {
    store: Arc<dyn VectorStore>,
    batch_size: usize,
}

impl DenseRetriever {
    pub fn new(store: Arc<dyn VectorStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        self.store.search(vector, k, category).await
    }

    /// Write `points` of `doc_id` in batches of `batch_size`.
    ///
    /// The first failing batch stops the write; the error names the first
    /// chunk of that batch.
    pub async fn upsert(&self, doc_id: &str, points: Vec<VectorPoint>) -> Result<()> {
        let total = points.len();
        let mut remaining = points.into_iter().peekable();
        let mut written = 0usize;

        while remaining.peek().is_some() {
            let batch: Vec<VectorPoint> = remaining.by_ref().take(self.batch_size).collect();
            let first_chunk = batch.first().map_or(written, |p| p.payload.chunk_index);
            let len = batch.len();

            if let Err(e) = self.store.upsert(batch).await {
                tracing::error!(
                    "Upsert of '{doc_id}' failed at chunks {first_chunk}..{} ({written}/{total} written): {e:#}",
                    first_chunk + len
                );
                return Err(RagError::ingest(doc_id, first_chunk, e));
            }
            written += len;
        }

        tracing::debug!("Upserted {written} point(s) for '{doc_id}'");
        Ok(())
    }
}

// ─── In-memory store ─────────────────────────────────────

#[derive(Debug, Clone)]
struct VectorEntry {
    embedding: Vec<f32>,
    payload: ChunkPayload,
}

/// Process-local vector store with exact cosine search.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<String, VectorEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        let mut entries = self.entries.write();
        for point in points {
            entries.insert(
                point.id,
                VectorEntry {
                    embedding: point.vector,
                    payload: point.payload,
                },
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let entries = self.entries.read();

        let mut scored: Vec<(f32, &String, &VectorEntry)> = entries
            .iter()
            .filter(|(_, e)| match category {
                Some(cat) => e.payload.categories.iter().any(|c| c == cat),
                None => true,
            })
            .map(|(id, e)| (cosine_similarity(vector, &e.embedding), id, e))
            .collect();

        // Sort descending by score, ids break ties so results are stable
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(b.1))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, id, e)| e.payload.clone().into_hit(id.clone(), score))
            .collect())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.entries.write().retain(|_, e| e.payload.doc_id != doc_id);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
