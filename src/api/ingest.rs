use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;

use crate::models::{IngestRequest, IngestResponse};
use crate::state::AppState;

/// POST /api/rag/ingest - chunk, embed and index one document.
pub async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> (StatusCode, Json<IngestResponse>) {
    let doc_id = req.doc_id.trim().to_string();
    let result = state
        .engine
        .ingest(&doc_id, &req.text, &req.categories, req.title.as_deref())
        .await;

    match result {
        Ok(chunks_created) => (
            StatusCode::OK,
            Json(IngestResponse {
                success: true,
                doc_id,
                chunks_created,
                indexed_at: Some(Utc::now()),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Ingest of '{doc_id}' failed: {e:#}");
            (
                e.status_code(),
                Json(IngestResponse {
                    success: false,
                    doc_id,
                    chunks_created: 0,
                    indexed_at: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}
