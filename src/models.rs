use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A passage cut from a source document. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Chunk {
    /// Storage identity derived from `docId:chunkIndex:text`.
    ///
    /// The first 16 bytes of the SHA-256 digest are rendered as a UUID so the
    /// id is accepted as a point id by the vector store; re-ingesting identical
    /// content lands on the same slot.
    pub fn stable_id(&self) -> String {
        stable_chunk_id(&self.doc_id, self.chunk_index, &self.text)
    }
}

pub fn stable_chunk_id(doc_id: &str, chunk_index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// One hit from a single retriever. `score` is only comparable within the
/// list that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub title: Option<String>,
    pub score: f32,
}

/// A hit after reciprocal-rank fusion of the dense and sparse lists.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FusedResult {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub title: Option<String>,
    pub rrf_score: f32,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
    pub in_dense: bool,
    pub in_sparse: bool,
}

/// A chunk handed to the generator and returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceChunk {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub relevance_score: f32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f32>,
    /// 1-based position before reranking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_rank: Option<usize>,
}

impl SourceChunk {
    pub fn from_hit(hit: SearchHit) -> Self {
        Self {
            id: hit.id,
            doc_id: hit.doc_id,
            chunk_index: hit.chunk_index,
            relevance_score: hit.score,
            text: hit.text,
            title: hit.title,
            rrf_score: None,
            original_rank: None,
        }
    }

    /// Calibrated relevance for a fused hit is its dense similarity; a hit
    /// found only lexically carries no comparable score.
    pub fn from_fused(fused: FusedResult) -> Self {
        Self {
            id: fused.id,
            doc_id: fused.doc_id,
            chunk_index: fused.chunk_index,
            relevance_score: fused.dense_score.unwrap_or(0.0),
            text: fused.text,
            title: fused.title,
            rrf_score: Some(fused.rrf_score),
            original_rank: None,
        }
    }

    /// Key used to de-duplicate sources across retrieval rounds.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.doc_id, self.chunk_index)
    }
}

/// Highest relevance score among `sources`, 0.0 when empty.
pub fn top_relevance(sources: &[SourceChunk]) -> f32 {
    sources
        .iter()
        .map(|s| s.relevance_score)
        .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))))
        .unwrap_or(0.0)
}

/// The answer to one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceChunk>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceCategory {
    Correct,
    Ambiguous,
    Incorrect,
}

/// How far the retrieved evidence can be trusted for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceEvaluation {
    pub confidence_score: f32,
    pub top_score: f32,
    pub category: ConfidenceCategory,
    pub reason: String,
    pub applied_strategies: Vec<String>,
    pub retries_performed: usize,
    pub expanded_queries: Vec<String>,
}

/// Everything needed to answer one question.
#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub question: String,
    pub top_k: Option<usize>,
    pub category: Option<String>,
    /// Override the configured reranker (`Some(false)` disables it)
    pub rerank: Option<bool>,
    /// Override corrective retrieval
    pub crag: Option<bool>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Result of `ask`, with the evaluation that shaped it.
#[derive(Debug, Clone)]
pub struct AskOutcome {
    pub result: QueryResult,
    /// `None` on a cache hit
    pub evaluation: Option<ConfidenceEvaluation>,
    pub cached: bool,
}

/// One event of a streamed answer, emitted in the order
/// `sources → prompt → token* → done | error`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Sources {
        sources: Vec<SourceChunk>,
        #[serde(skip_serializing_if = "Option::is_none")]
        evaluation: Option<ConfidenceEvaluation>,
    },
    Prompt {
        prompt: String,
    },
    Token {
        text: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Prompt { .. } => "prompt",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Done => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

// ─── HTTP request/response bodies ────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub doc_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub categories: Vec<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub success: bool,
    pub doc_id: String,
    pub chunks_created: usize,
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    pub top_k: Option<usize>,
    pub category: Option<String>,
}

/// `?rerank=&crag=` flags on the query endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryFlags {
    pub rerank: Option<bool>,
    pub crag: Option<bool>,
}

impl QueryRequest {
    pub fn into_ask(self, flags: QueryFlags) -> AskRequest {
        AskRequest {
            question: self.question,
            top_k: self.top_k,
            category: self.category.filter(|c| !c.trim().is_empty()),
            rerank: flags.rerank,
            crag: flags.crag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub question: String,
    pub answer: Option<String>,
    pub sources: Vec<SourceChunk>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<ConfidenceEvaluation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub success: bool,
    pub doc_id: String,
    pub removed: bool,
}
