use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::models::DeleteResponse;
use crate::state::AppState;

/// DELETE /api/rag/documents/{doc_id}
pub async fn delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DeleteResponse>, (StatusCode, String)> {
    let removed = state
        .engine
        .delete_document(&doc_id)
        .await
        .map_err(|e| (e.status_code(), e.to_string()))?;
    Ok(Json(DeleteResponse {
        success: true,
        doc_id,
        removed,
    }))
}

/// GET /api/rag/stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    let stats = state
        .engine
        .stats()
        .await
        .map_err(|e| (e.status_code(), e.to_string()))?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

/// POST /api/rag/cache/clear
pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    let dropped = state.engine.clear_cache();
    Json(json!({ "success": true, "entriesCleared": dropped }))
}

/// POST /api/rag/index/clear - reset the lexical index; documents must be
/// re-ingested to be found lexically again.
pub async fn clear_index(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .engine
        .clear_sparse_index()
        .await
        .map_err(|e| (e.status_code(), e.to_string()))?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
