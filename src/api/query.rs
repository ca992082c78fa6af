use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::error::RagError;
use crate::models::{AskOutcome, QueryFlags, QueryRequest, QueryResponse};
use crate::state::AppState;

/// POST /api/rag/query?rerank=&crag= - answer a question.
pub async fn query(
    State(state): State<AppState>,
    Query(flags): Query<QueryFlags>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<QueryResponse>) {
    answer(&state, req, flags, false).await
}

/// POST /api/rag/query/crag - corrective answering, with the confidence
/// evaluation in the response.
pub async fn query_crag(
    State(state): State<AppState>,
    Query(flags): Query<QueryFlags>,
    Json(req): Json<QueryRequest>,
) -> (StatusCode, Json<QueryResponse>) {
    let flags = QueryFlags {
        crag: Some(true),
        ..flags
    };
    answer(&state, req, flags, true).await
}

async fn answer(
    state: &AppState,
    req: QueryRequest,
    flags: QueryFlags,
    with_evaluation: bool,
) -> (StatusCode, Json<QueryResponse>) {
    let question = req.question.clone();
    match state.engine.ask(req.into_ask(flags)).await {
        Ok(outcome) => (StatusCode::OK, Json(success(outcome, with_evaluation))),
        Err(e) => {
            tracing::warn!("Query failed: {e:#}");
            (e.status_code(), Json(failure(question, &e)))
        }
    }
}

fn success(outcome: AskOutcome, with_evaluation: bool) -> QueryResponse {
    QueryResponse {
        success: true,
        question: outcome.result.question,
        answer: Some(outcome.result.answer),
        sources: outcome.result.sources,
        cached: outcome.cached,
        evaluation: outcome.evaluation.filter(|_| with_evaluation),
        error: None,
    }
}

pub(crate) fn failure(question: String, err: &RagError) -> QueryResponse {
    QueryResponse {
        success: false,
        question,
        answer: None,
        sources: Vec::new(),
        cached: false,
        evaluation: None,
        error: Some(err.to_string()),
    }
}
