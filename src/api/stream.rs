use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};

use crate::api::query::failure;
use crate::models::{QueryFlags, QueryRequest, QueryResponse, StreamEvent};
use crate::state::AppState;

/// POST /api/rag/query/stream - answer as server-sent events.
///
/// Event names follow [`StreamEvent::name`]. If no event arrives within the
/// idle timeout the stream ends with an `error` event, which also drops the
/// engine's stream and so cancels generation.
pub async fn query_stream(
    State(state): State<AppState>,
    Query(flags): Query<QueryFlags>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<QueryResponse>)> {
    let question = req.question.clone();
    let events = state
        .engine
        .ask_stream(req.into_ask(flags))
        .map_err(|e| (e.status_code(), Json(failure(question, &e))))?;

    let idle_timeout = Duration::from_secs(state.engine.config().generation.stream_idle_timeout_secs);

    let sse_stream = stream::unfold(Some(events), move |events| async move {
        let mut events = events?;
        match tokio::time::timeout(idle_timeout, events.next()).await {
            Ok(Some(event)) => {
                let next = if event.is_terminal() { None } else { Some(events) };
                Some((Ok(to_sse(&event)), next))
            }
            // Engine task ended without a terminal event
            Ok(None) => None,
            Err(_) => {
                tracing::warn!("Answer stream idle for {idle_timeout:?}, closing");
                let event = StreamEvent::Error {
                    message: "Answer stream timed out (idle)".to_string(),
                };
                Some((Ok(to_sse(&event)), None))
            }
        }
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|e| {
            Event::default()
                .event("error")
                .data(format!("failed to encode {} event: {e}", event.name()))
        })
}
