//! The query orchestrator.
//!
//! [`RagEngine`] owns every stage of the pipeline behind a trait object so
//! that deployments wire HTTP clients and tests wire deterministic fakes:
//!
//! ```text
//! ingest: Chunker → EmbeddingGateway (throttled) → DenseRetriever (batched upsert)
//!                                               → SparseIndex (hybrid only)
//!
//! ask:    QueryCache ─hit──────────────────────────────────────────────→ result
//!           │ miss
//!           ▼
//!         EmbeddingGateway → Retriever (dense | hybrid) → Reranker
//!           → ConfidenceEvaluator → corrective strategies (CRAG)
//!           → refusal | prompt → Generator → QueryCache admission → result
//! ```

use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::cache::{Admission, QueryCache};
use crate::chunking::Chunker;
use crate::config::{Config, RerankerProvider, VectorStoreKind};
use crate::crag::evaluator::ConfidenceEvaluator;
use crate::crag::{add_uncertainty_marker, CorrectiveRetrieval, SourceSearch, Strategy};
use crate::error::{RagError, Result};
use crate::llm::chat::{ChatClient, GenerationRequest, Generator};
use crate::llm::embeddings::{Embedder, EmbeddingGateway, HttpEmbedder};
use crate::llm::rerank::{
    rerank_or_passthrough, CrossEncoderReranker, LlmReranker, PassThrough, Reranker,
};
use crate::models::{
    AskOutcome, AskRequest, Chunk, ConfidenceCategory, ConfidenceEvaluation, QueryResult,
    SourceChunk, StreamEvent,
};
use crate::prompt::{build_prompt, refusal_note, word_tokens, REFUSAL_ANSWER};
use crate::search::bm25::{Bm25Index, SparseDocument, SparseIndex, SparseStats};
use crate::search::hybrid::{FusionWeights, HybridRetriever, Retriever};
use crate::search::qdrant::QdrantStore;
use crate::search::vector::{ChunkPayload, DenseRetriever, InMemoryVectorStore, VectorPoint, VectorStore};

pub const MAX_QUESTION_CHARS: usize = 2000;
pub const MAX_TOP_K: usize = 50;

const STREAM_BUFFER: usize = 64;
const CACHED_PROMPT_NOTE: &str = "Answer served from cache";

/// External collaborators of the engine.
pub struct EngineComponents {
    pub embedder: Arc<dyn Embedder>,
    pub vector_store: Arc<dyn VectorStore>,
    pub sparse_index: Arc<dyn SparseIndex>,
    pub generator: Arc<dyn Generator>,
    pub reranker: Arc<dyn Reranker>,
}

impl EngineComponents {
    /// HTTP-backed components described by `config`.
    pub fn from_config(config: &Config, client: reqwest::Client) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(client.clone(), config.llm.clone()));
        let generator: Arc<dyn Generator> = Arc::new(ChatClient::new(client.clone(), config.llm.clone()));

        let vector_store: Arc<dyn VectorStore> = match config.vector_store.kind {
            VectorStoreKind::Qdrant => Arc::new(QdrantStore::new(client.clone(), &config.vector_store)),
            VectorStoreKind::Memory => Arc::new(InMemoryVectorStore::new()),
        };

        let reranker: Arc<dyn Reranker> = match config.reranker.provider {
            RerankerProvider::None => Arc::new(PassThrough),
            RerankerProvider::CrossEncoder => {
                if config.reranker.base_url.is_none() {
                    return Err(RagError::Config(
                        "cross-encoder reranker needs RERANKER_BASE_URL".into(),
                    ));
                }
                Arc::new(CrossEncoderReranker::new(client, config.reranker.clone()))
            }
            RerankerProvider::Llm => Arc::new(LlmReranker::new(generator.clone(), &config.reranker)),
        };

        Ok(Self {
            embedder,
            vector_store,
            sparse_index: Arc::new(Bm25Index::new()?),
            generator,
            reranker,
        })
    }
}

/// A validated question.
#[derive(Debug, Clone)]
struct QueryPlan {
    question: String,
    top_k: usize,
    category: Option<String>,
    rerank: bool,
    crag: bool,
    cache_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub lexical_index: SparseStats,
    pub vector_points: usize,
    pub embedding_dimension: Option<usize>,
    pub cache_entries: usize,
    pub cache_capacity: usize,
    pub retrieval_mode: &'static str,
    pub reranker: &'static str,
    pub crag_enabled: bool,
}

pub struct RagEngine {
    config: Config,
    chunker: Chunker,
    embeddings: EmbeddingGateway,
    dense: Arc<DenseRetriever>,
    sparse: Arc<dyn SparseIndex>,
    retriever: Arc<dyn Retriever>,
    reranker: Arc<dyn Reranker>,
    generator: Arc<dyn Generator>,
    evaluator: ConfidenceEvaluator,
    cache: QueryCache,
}

impl RagEngine {
    pub fn new(config: Config, components: EngineComponents) -> Result<Self> {
        config.validate()?;

        let chunker = Chunker::new(config.chunking.clone())?;
        let embeddings = EmbeddingGateway::new(components.embedder, config.max_concurrent_embeddings);
        let dense = Arc::new(DenseRetriever::new(
            components.vector_store,
            config.vector_store.batch_size,
        ));

        let retriever: Arc<dyn Retriever> = if config.retrieval.hybrid_enabled {
            Arc::new(HybridRetriever::new(
                dense.clone(),
                components.sparse_index.clone(),
                FusionWeights::from(&config.retrieval),
                config.retrieval.degrade_on_sparse_failure,
            ))
        } else {
            let dense_only: Arc<dyn Retriever> = dense.clone();
            dense_only
        };

        let evaluator = ConfidenceEvaluator::new(config.confidence.clone())
            .with_judge(components.generator.clone());
        let cache = QueryCache::new(config.cache.clone());

        tracing::info!(
            "RAG engine ready: retrieval={}, reranker={}, crag={}",
            retriever.mode(),
            components.reranker.name(),
            config.corrective.enabled
        );

        Ok(Self {
            config,
            chunker,
            embeddings,
            dense,
            sparse: components.sparse_index,
            retriever,
            reranker: components.reranker,
            generator: components.generator,
            evaluator,
            cache,
        })
    }

    /// Engine backed by the HTTP services named in `config`.
    pub fn from_config(config: Config, client: reqwest::Client) -> Result<Self> {
        let components = EngineComponents::from_config(&config, client)?;
        Self::new(config, components)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    // ─── Ingestion ───────────────────────────────────────

    /// Chunk, embed and index one document; returns the number of chunks.
    ///
    /// The first chunk that fails to embed aborts the call; nothing of the
    /// document is written in that case. Chunk ids are derived from content,
    /// so re-ingesting the same text overwrites the same points.
    pub async fn ingest(
        &self,
        doc_id: &str,
        text: &str,
        categories: &[String],
        title: Option<&str>,
    ) -> Result<usize> {
        let doc_id = doc_id.trim();
        if doc_id.is_empty() {
            return Err(RagError::Validation("docId must not be blank".into()));
        }
        if text.trim().is_empty() {
            return Err(RagError::Validation("text must not be blank".into()));
        }

        let categories: Vec<String> = categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let title = title.map(str::trim).filter(|t| !t.is_empty()).map(String::from);

        let chunks: Vec<Chunk> = self
            .chunker
            .chunk(text)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, text)| Chunk {
                doc_id: doc_id.to_string(),
                chunk_index,
                text,
                categories: categories.clone(),
                title: title.clone(),
            })
            .collect();
        tracing::info!("Ingesting '{doc_id}': {} chunk(s)", chunks.len());

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = self.embeddings.embed(&chunk.text).await.map_err(|e| {
                let err = RagError::ingest(doc_id, chunk.chunk_index, e);
                tracing::error!("Ingest of '{doc_id}' aborted: {err:#}");
                err
            })?;
            vectors.push(vector);
        }

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.stable_id(),
                vector,
                payload: ChunkPayload::from(chunk),
            })
            .collect();
        self.dense.upsert(doc_id, points).await?;

        if self.config.retrieval.hybrid_enabled {
            let docs: Vec<SparseDocument> = chunks
                .iter()
                .map(|chunk| SparseDocument::from_chunk(chunk.stable_id(), chunk))
                .collect();
            let sparse = self.sparse.clone();
            run_blocking(move || sparse.index(&docs))
                .await
                .map_err(|e| RagError::ingest(doc_id, 0, e))?;
        }

        let stale = self.cache.invalidate_document(doc_id);
        if stale > 0 {
            tracing::debug!("Dropped {stale} cached answer(s) citing '{doc_id}'");
        }
        tracing::info!("Ingested '{doc_id}': {} chunk(s)", chunks.len());
        Ok(chunks.len())
    }

    /// Remove a document from both indexes and from cached answers.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let doc_id = doc_id.trim();
        if doc_id.is_empty() {
            return Err(RagError::Validation("docId must not be blank".into()));
        }

        self.dense.store().delete_document(doc_id).await?;
        let sparse = self.sparse.clone();
        let owned = doc_id.to_string();
        let removed = run_blocking(move || sparse.remove_document(&owned)).await?;
        self.cache.invalidate_document(doc_id);

        tracing::info!("Deleted '{doc_id}' (lexical entries removed: {removed})");
        Ok(removed)
    }

    // ─── Questions ───────────────────────────────────────

    /// Answer a question, from the cache when possible.
    pub async fn ask(&self, request: AskRequest) -> Result<AskOutcome> {
        let plan = self.plan(request)?;

        if let Some(cached) = self.cache.get(&plan.cache_key) {
            tracing::info!("Cache hit for '{}'", plan.question);
            return Ok(AskOutcome {
                result: cached.result,
                evaluation: cached.evaluation,
                cached: true,
            });
        }

        let (sources, mut evaluation) = self.retrieve_and_evaluate(&plan).await?;

        let refused = evaluation.category == ConfidenceCategory::Incorrect;
        let answer = if refused {
            evaluation.record(Strategy::LowRelevanceRefusal);
            tracing::info!(
                "Refusing '{}': top relevance {:.3} below {:.3}",
                plan.question,
                evaluation.top_score,
                self.config.confidence.min_relevance_score
            );
            REFUSAL_ANSWER.to_string()
        } else {
            let prompt = build_prompt(&plan.question, &sources, evaluation.category);
            let answer = self.generator.complete(&self.answer_request(prompt)).await?;
            let answer = answer.trim();
            if plan.crag && evaluation.category == ConfidenceCategory::Ambiguous {
                add_uncertainty_marker(answer)
            } else {
                answer.to_string()
            }
        };

        let result = QueryResult {
            question: plan.question.clone(),
            answer,
            sources,
        };
        if !refused {
            self.admit(&plan, &result, &evaluation);
        }

        Ok(AskOutcome {
            result,
            evaluation: Some(evaluation),
            cached: false,
        })
    }

    /// Answer a question as a stream of events.
    ///
    /// The request is validated before this returns. Events arrive as
    /// `sources`, `prompt`, `token`*, then `done` or `error`. Dropping the
    /// returned stream cancels generation.
    pub fn ask_stream(self: &Arc<Self>, request: AskRequest) -> Result<AnswerStream> {
        let plan = self.plan(request)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            match engine.stream_answer(&plan, &tx).await {
                Ok(true) => {
                    let _ = tx.send(StreamEvent::Done).await;
                }
                Ok(false) => {
                    tracing::info!("Stream consumer for '{}' went away, generation cancelled", plan.question);
                }
                Err(e) => {
                    tracing::warn!("Streaming answer for '{}' failed: {e:#}", plan.question);
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(AnswerStream { rx })
    }

    /// Produce every event but the terminal one. `Ok(false)` means the
    /// consumer stopped listening.
    async fn stream_answer(&self, plan: &QueryPlan, tx: &mpsc::Sender<StreamEvent>) -> Result<bool> {
        if let Some(cached) = self.cache.get(&plan.cache_key) {
            tracing::info!("Cache hit for '{}' (stream)", plan.question);
            let delivered = emit(
                tx,
                StreamEvent::Sources {
                    sources: cached.result.sources,
                    evaluation: cached.evaluation,
                },
            )
            .await
                && emit(
                    tx,
                    StreamEvent::Prompt {
                        prompt: CACHED_PROMPT_NOTE.to_string(),
                    },
                )
                .await
                && emit_words(tx, &cached.result.answer).await;
            return Ok(delivered);
        }

        let (sources, mut evaluation) = self.retrieve_and_evaluate(plan).await?;

        if evaluation.category == ConfidenceCategory::Incorrect {
            evaluation.record(Strategy::LowRelevanceRefusal);
            let note = refusal_note(evaluation.top_score);
            tracing::info!("Refusing '{}' (stream): {note}", plan.question);
            let delivered = emit(
                tx,
                StreamEvent::Sources {
                    sources,
                    evaluation: Some(evaluation),
                },
            )
            .await
                && emit(tx, StreamEvent::Prompt { prompt: note }).await
                && emit_words(tx, REFUSAL_ANSWER).await;
            return Ok(delivered);
        }

        let prompt = build_prompt(&plan.question, &sources, evaluation.category);
        let opened = emit(
            tx,
            StreamEvent::Sources {
                sources: sources.clone(),
                evaluation: Some(evaluation.clone()),
            },
        )
        .await
            && emit(
                tx,
                StreamEvent::Prompt {
                    prompt: prompt.clone(),
                },
            )
            .await;
        if !opened {
            return Ok(false);
        }

        let mut tokens = self.generator.stream(&self.answer_request(prompt)).await?;
        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                _ = tx.closed() => return Ok(false),
                next = tokens.next() => next,
            };
            match next {
                Some(Ok(text)) => {
                    answer.push_str(&text);
                    if !emit(tx, StreamEvent::Token { text }).await {
                        return Ok(false);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        // Same key as `ask`; cache the hedged text
        let answer = answer.trim();
        let answer = if plan.crag && evaluation.category == ConfidenceCategory::Ambiguous {
            add_uncertainty_marker(answer)
        } else {
            answer.to_string()
        };
        let result = QueryResult {
            question: plan.question.clone(),
            answer,
            sources,
        };
        self.admit(plan, &result, &evaluation);
        Ok(true)
    }

    fn plan(&self, request: AskRequest) -> Result<QueryPlan> {
        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(RagError::Validation("question must not be blank".into()));
        }
        if question.chars().count() > MAX_QUESTION_CHARS {
            return Err(RagError::Validation(format!(
                "question must be at most {MAX_QUESTION_CHARS} characters"
            )));
        }

        let top_k = request.top_k.unwrap_or(self.config.retrieval.default_top_k);
        if !(1..=MAX_TOP_K).contains(&top_k) {
            return Err(RagError::Validation(format!(
                "topK must be between 1 and {MAX_TOP_K}, got {top_k}"
            )));
        }

        let category = request
            .category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let cache_key = QueryCache::key(&question, top_k, category.as_deref());

        Ok(QueryPlan {
            question,
            top_k,
            category,
            rerank: request.rerank.unwrap_or(true),
            crag: request.crag.unwrap_or(self.config.corrective.enabled),
            cache_key,
        })
    }

    /// Embed, retrieve and rerank for one phrasing of the question.
    async fn search_sources(&self, query: &str, plan: &QueryPlan) -> Result<Vec<SourceChunk>> {
        let vector = self.embeddings.embed(query).await?;
        let reranker: &dyn Reranker = if plan.rerank {
            self.reranker.as_ref()
        } else {
            &PassThrough
        };
        let candidates = reranker.candidate_count(plan.top_k).max(plan.top_k);
        let first_pass = self
            .retriever
            .retrieve(query, &vector, candidates, plan.category.as_deref())
            .await?;
        Ok(rerank_or_passthrough(reranker, query, first_pass, plan.top_k).await)
    }

    async fn retrieve_and_evaluate(
        &self,
        plan: &QueryPlan,
    ) -> Result<(Vec<SourceChunk>, ConfidenceEvaluation)> {
        let sources = self.search_sources(&plan.question, plan).await?;
        let evaluation = self.evaluator.evaluate(&plan.question, &sources).await;
        if !plan.crag {
            return Ok((sources, evaluation));
        }

        let corrected = CorrectiveRetrieval {
            config: &self.config.corrective,
            evaluator: &self.evaluator,
            generator: self.generator.as_ref(),
            top_k: plan.top_k,
        }
        .correct(
            &PlanSearch { engine: self, plan },
            &plan.question,
            sources,
            evaluation,
        )
        .await?;
        Ok((corrected.sources, corrected.evaluation))
    }

    fn answer_request(&self, prompt: String) -> GenerationRequest {
        GenerationRequest::new(
            prompt,
            self.config.generation.temperature,
            self.config.generation.max_tokens,
        )
    }

    fn admit(&self, plan: &QueryPlan, result: &QueryResult, evaluation: &ConfidenceEvaluation) {
        match self.cache.admit(&plan.cache_key, result, Some(evaluation)) {
            Admission::Stored => tracing::debug!("Cached answer for '{}'", plan.question),
            other => tracing::debug!("Answer for '{}' not cached: {other:?}", plan.question),
        }
    }

    // ─── Maintenance ─────────────────────────────────────

    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            lexical_index: self.sparse.stats(),
            vector_points: self.dense.store().count().await?,
            embedding_dimension: self.embeddings.dimension(),
            cache_entries: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            retrieval_mode: self.retriever.mode(),
            reranker: self.reranker.name(),
            crag_enabled: self.config.corrective.enabled,
        })
    }

    /// Drop every lexical posting. Re-ingest to rebuild.
    pub async fn clear_sparse_index(&self) -> Result<()> {
        let sparse = self.sparse.clone();
        run_blocking(move || sparse.clear()).await?;
        tracing::info!("Lexical index cleared");
        Ok(())
    }

    pub fn clear_cache(&self) -> usize {
        let dropped = self.cache.clear();
        tracing::info!("Query cache cleared ({dropped} entries)");
        dropped
    }
}

/// Retrieval for an alternative phrasing, under the original request's
/// limits and filters.
struct PlanSearch<'a> {
    engine: &'a RagEngine,
    plan: &'a QueryPlan,
}

#[async_trait::async_trait]
impl SourceSearch for PlanSearch<'_> {
    async fn search(&self, query: &str) -> Result<Vec<SourceChunk>> {
        self.engine.search_sources(query, self.plan).await
    }
}

/// Events of one streamed answer.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

async fn emit_words(tx: &mpsc::Sender<StreamEvent>, text: &str) -> bool {
    for word in word_tokens(text) {
        if !emit(
            tx,
            StreamEvent::Token {
                text: word.to_string(),
            },
        )
        .await
        {
            return false;
        }
    }
    true
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RagError::Retrieval(format!("Lexical index task failed: {e}")))?
}
