pub mod admin;
pub mod ingest;
pub mod query;
pub mod stream;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/rag/ingest", post(ingest::ingest))
        .route("/api/rag/query", post(query::query))
        .route("/api/rag/query/crag", post(query::query_crag))
        .route("/api/rag/query/stream", post(stream::query_stream))
        .route("/api/rag/documents/{doc_id}", delete(admin::delete_document))
        .route("/api/rag/stats", get(admin::stats))
        .route("/api/rag/cache/clear", post(admin::clear_cache))
        .route("/api/rag/index/clear", post(admin::clear_index))
        .route("/api/health", get(admin::health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineComponents, RagEngine};
    use crate::error::{RagError, Result};
    use crate::llm::chat::{GenerationRequest, Generator, TokenStream};
    use crate::llm::embeddings::Embedder;
    use crate::llm::rerank::PassThrough;
    use crate::search::bm25::Bm25Index;
    use crate::search::vector::InMemoryVectorStore;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures_util::stream;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const DOC_TEXT: &str = "Rate limiting caps how many requests a client can send. The gateway \
        enforces one rate per API key. Clients over the rate receive status 429.";
    const ANSWER: &str = "Clients over their limit receive status 429.";

    /// Counts "rate" plus a bias dimension; fails on "POISON".
    struct RateEmbedder;

    #[async_trait]
    impl Embedder for RateEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("POISON") {
                return Err(RagError::Embedding("model returned 500".into()));
            }
            let rate = text.to_lowercase().matches("rate").count() as f32;
            Ok(vec![rate, 1.0])
        }
    }

    /// Fixed answer; `stall` makes the token stream never yield.
    struct FixedGenerator {
        stall: bool,
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn complete(&self, _: &GenerationRequest) -> Result<String> {
            Ok(ANSWER.to_string())
        }

        async fn stream(&self, _: &GenerationRequest) -> Result<TokenStream> {
            if self.stall {
                return Ok(Box::pin(stream::pending::<Result<String>>()));
            }
            let tokens: Vec<Result<String>> = ANSWER
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(Box::pin(stream::iter(tokens)))
        }
    }

    fn app_with(config: Config, stall: bool) -> Router {
        let engine = RagEngine::new(
            config,
            EngineComponents {
                embedder: Arc::new(RateEmbedder),
                vector_store: Arc::new(InMemoryVectorStore::new()),
                sparse_index: Arc::new(Bm25Index::new().unwrap()),
                generator: Arc::new(FixedGenerator { stall }),
                reranker: Arc::new(PassThrough),
            },
        )
        .unwrap();
        router(AppState::with_engine(Arc::new(engine)))
    }

    fn app() -> Router {
        app_with(Config::default(), false)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bare(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Event names and data lines of a finished SSE body.
    async fn sse_events(app: &Router, request: Request<Body>) -> Vec<(String, String)> {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/event-stream"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        body.split("\n\n")
            .filter_map(|block| {
                let mut name = None;
                let mut data = String::new();
                for line in block.lines() {
                    if let Some(n) = line.strip_prefix("event:") {
                        name = Some(n.trim().to_string());
                    } else if let Some(d) = line.strip_prefix("data:") {
                        data.push_str(d.trim_start());
                    }
                }
                name.map(|n| (n, data))
            })
            .collect()
    }

    async fn ingest_doc(app: &Router) {
        let (status, body) = call(
            app,
            post(
                "/api/rag/ingest",
                json!({ "docId": "rate-doc", "text": DOC_TEXT, "categories": ["infra"] }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["docId"], "rate-doc");
        assert_eq!(body["chunksCreated"], 1);
        assert!(body["indexedAt"].is_string());
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let app = app();
        ingest_doc(&app).await;

        let (status, body) = call(
            &app,
            post("/api/rag/query", json!({ "question": "What is rate limiting?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["answer"], ANSWER);
        assert_eq!(body["cached"], false);
        assert_eq!(body["sources"][0]["docId"], "rate-doc");
        assert!(body.get("evaluation").is_none());

        // Same cache key; the hit still reports its evaluation
        let (status, body) = call(
            &app,
            post("/api/rag/query/crag", json!({ "question": "what is rate limiting?" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cached"], true);
        assert_eq!(body["evaluation"]["category"], "CORRECT");
        assert_eq!(body["evaluation"]["appliedStrategies"][0], "direct_use");
    }

    #[tokio::test]
    async fn test_ingest_error_status() {
        let app = app();

        let (status, body) = call(
            &app,
            post("/api/rag/ingest", json!({ "docId": "  ", "text": DOC_TEXT })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("docId"));

        let (status, body) = call(
            &app,
            post("/api/rag/ingest", json!({ "docId": "bad", "text": "POISON text" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
        assert_eq!(body["chunksCreated"], 0);
        assert!(body["indexedAt"].is_null());
        let error = body["error"].as_str().unwrap();
        assert!(error.contains("'bad'") && error.contains("chunk 0"), "{error}");
    }

    #[tokio::test]
    async fn test_blank_question_is_bad_request() {
        let app = app();
        let (status, body) = call(&app, post("/api/rag/query", json!({ "question": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["answer"].is_null());

        let response = app
            .clone()
            .oneshot(post("/api/rag/query/stream", json!({ "question": "q", "topK": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_events() {
        let app = app();
        ingest_doc(&app).await;

        let events = sse_events(
            &app,
            post("/api/rag/query/stream", json!({ "question": "What is rate limiting?" })),
        )
        .await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names[0], "sources");
        assert_eq!(names[1], "prompt");
        assert_eq!(*names.last().unwrap(), "done");
        assert!(names[2..names.len() - 1].iter().all(|n| *n == "token"));

        let sources: Value = serde_json::from_str(&events[0].1).unwrap();
        assert_eq!(sources["sources"][0]["docId"], "rate-doc");
        let answer: String = events
            .iter()
            .filter(|(n, _)| n == "token")
            .map(|(_, d)| {
                let token: Value = serde_json::from_str(d).unwrap();
                token["text"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(answer, ANSWER);
    }

    #[tokio::test]
    async fn test_stream_idle_timeout_ends_with_error() {
        let mut config = Config::default();
        config.generation.stream_idle_timeout_secs = 1;
        let app = app_with(config, true);
        ingest_doc(&app).await;

        let events = sse_events(
            &app,
            post("/api/rag/query/stream", json!({ "question": "What is rate limiting?" })),
        )
        .await;
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["sources", "prompt", "error"]);
        let error: Value = serde_json::from_str(&events[2].1).unwrap();
        assert!(error["message"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let app = app();
        ingest_doc(&app).await;
        call(&app, post("/api/rag/query", json!({ "question": "What is rate limiting?" }))).await;

        let (status, body) = call(&app, bare("GET", "/api/rag/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["vectorPoints"], 1);
        assert_eq!(body["stats"]["cacheEntries"], 1);

        let (_, body) = call(&app, bare("POST", "/api/rag/cache/clear")).await;
        assert_eq!(body["entriesCleared"], 1);

        let (status, body) = call(&app, bare("DELETE", "/api/rag/documents/rate-doc")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["docId"], "rate-doc");
        assert_eq!(body["removed"], true);

        let (_, body) = call(&app, bare("GET", "/api/rag/stats")).await;
        assert_eq!(body["stats"]["vectorPoints"], 0);

        let (status, body) = call(&app, bare("POST", "/api/rag/index/clear")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = call(&app, bare("GET", "/api/health")).await;
        assert_eq!(body["status"], "ok");
    }
}
