//! Cross-encoder scoring via an OpenAI-compatible `/v1/rerank` endpoint
//! (llama-server, TEI, Jina-style servers).
//!
//! All query-document pairs go out in one request.

use serde::{Deserialize, Serialize};

use crate::config::RerankerConfig;
use crate::error::{RagError, Result};

/// Result of reranking a single document.
#[derive(Debug, Clone)]
pub struct RerankResult {
    /// Index into the original documents array.
    pub index: usize,
    /// Relevance score in 0.0 - 1.0.
    pub score: f32,
}

/// Score `documents` against `query`.
///
/// Tries `/v1/rerank` first and falls back to `/rerank` when the server does
/// not know the versioned route. Returns results sorted by score descending.
pub async fn rerank(
    client: &reqwest::Client,
    config: &RerankerConfig,
    query: &str,
    documents: &[String],
    top_n: usize,
) -> Result<Vec<RerankResult>> {
    let base_url = config
        .base_url
        .as_deref()
        .ok_or_else(|| RagError::Config("Reranker base_url not configured".into()))?
        .trim_end_matches('/');

    let req_body = RerankRequest {
        model: config.model.as_deref().unwrap_or("default"),
        query,
        documents,
        top_n,
    };

    let timeout = std::time::Duration::from_secs(config.timeout_secs.min(30));

    let mut last_err = None;
    for path in ["/v1/rerank", "/rerank"] {
        let resp = client
            .post(format!("{base_url}{path}"))
            .timeout(timeout)
            .json(&req_body)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to reach reranker endpoint: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            last_err = Some(RagError::Retrieval(format!("Reranker has no {path} route")));
            continue;
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::Retrieval(format!(
                "Reranker returned {status}: {body}"
            )));
        }

        let body: RerankResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Retrieval(format!("Failed to parse reranker response: {e}")))?;
        return Ok(normalize(body.results));
    }

    Err(last_err.unwrap_or_else(|| RagError::Retrieval("Reranker unreachable".into())))
}

/// Servers that return logits get a sigmoid; servers that already return
/// probabilities are left alone. The decision is per response so the
/// relative order is never disturbed.
fn normalize(raw: Vec<RerankResultRaw>) -> Vec<RerankResult> {
    let is_probability = raw
        .iter()
        .all(|r| (0.0..=1.0).contains(&r.relevance_score));

    let mut results: Vec<RerankResult> = raw
        .into_iter()
        .map(|r| RerankResult {
            index: r.index,
            score: if is_probability {
                r.relevance_score
            } else {
                sigmoid(r.relevance_score)
            },
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

/// Sigmoid normalization: maps raw logits to 0-1 range.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ─── Request/Response types ────────────────────────────

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(index: usize, relevance_score: f32) -> RerankResultRaw {
        RerankResultRaw {
            index,
            relevance_score,
        }
    }

    #[test]
    fn test_sigmoid_known_values() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!((sigmoid(1.0) - 0.7310586).abs() < 1e-5);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn test_probabilities_pass_through() {
        let results = normalize(vec![raw(0, 0.2), raw(1, 0.9)]);
        assert_eq!(results[0].index, 1);
        assert!((results[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_logits_are_squashed_in_order() {
        let results = normalize(vec![raw(0, 0.8), raw(1, 1.2), raw(2, -3.0)]);
        let order: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 0, 2]);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[test]
    fn test_score_alias_parses() {
        let body: RerankResponse =
            serde_json::from_str(r#"{"results":[{"index":2,"score":0.4}]}"#).unwrap();
        assert_eq!(body.results[0].index, 2);
    }
}
