//! # rag-service
//!
//! A question-answering backend over a document knowledge base. Answers are
//! grounded in retrieved passages, and the service refuses to answer when
//! the evidence is too weak.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────┐
//!                        │   Question   │
//!                        └──────┬───────┘
//!                               │
//!                    ┌──────────▼──────────┐   hit
//!                    │     Query cache     ├──────────────► answer
//!                    └──────────┬──────────┘
//!                               │ miss
//!                    ┌──────────▼──────────┐
//!                    │  Embedding gateway  │  semaphore-throttled
//!                    └──────────┬──────────┘
//!                 ┌─────────────┴─────────────┐
//!                 ▼                           ▼
//!        ┌─────────────────┐        ┌──────────────────┐
//!        │  Dense search   │        │  BM25 (tantivy)  │
//!        │ Qdrant / memory │        │   2×topK each    │
//!        └────────┬────────┘        └────────┬─────────┘
//!                 └─────────────┬────────────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │  Weighted RRF fusion    │
//!                  │ dense 0.7, sparse 0.3   │
//!                  └────────────┬────────────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │ Reranker (optional)     │
//!                  │ cross-encoder | LLM     │
//!                  └────────────┬────────────┘
//!                               ▼
//!                  ┌─────────────────────────┐
//!                  │ Confidence evaluation   │
//!                  │ CORRECT / AMBIGUOUS /   │
//!                  │ INCORRECT → expand,     │
//!                  │ retry, merge            │
//!                  └────────────┬────────────┘
//!                    ┌──────────┴──────────┐
//!                    ▼                     ▼
//!               refusal            prompt → generator
//!                                  (sync or streamed)
//!                                          │
//!                                          ▼
//!                                  cache admission
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration with validated defaults
//! - [`error`] - `RagError`, the pipeline's error taxonomy and its HTTP mapping
//! - [`models`] - Chunks, hits, sources, evaluations, stream events, HTTP bodies
//! - [`chunking`] - Boundary-aware, overlapping, deterministic text chunking
//! - [`llm::embeddings`] - Embedding clients and the throttled `EmbeddingGateway`
//! - [`llm::chat`] - The `Generator` trait and an Ollama/OpenAI chat client
//! - [`llm::rerank`] - Pass-through, cross-encoder and LLM-judge rerankers
//! - [`llm::query_expand`] - Alternative phrasings for weak retrievals
//! - [`search::vector`] - `VectorStore` trait, batched dense retrieval, in-memory store
//! - [`search::qdrant`] - Qdrant REST implementation of `VectorStore`
//! - [`search::bm25`] - Lexical index powered by tantivy
//! - [`search::hybrid`] - Weighted reciprocal-rank fusion and the `Retriever` trait
//! - [`crag`] - Confidence evaluation and corrective strategies
//! - [`cache`] - Admission-gated, bounded answer cache
//! - [`prompt`] - Grounded-answer prompt and the fixed refusal
//! - [`engine`] - `RagEngine`: ingest, ask, ask_stream and maintenance
//! - [`api`] - Axum HTTP handlers, including SSE streaming
//! - [`state`] - Shared application state

pub mod api;
pub mod cache;
pub mod chunking;
pub mod config;
pub mod crag;
pub mod engine;
pub mod error;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod search;
pub mod state;
