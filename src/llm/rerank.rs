//! Second-pass reranking of first-stage candidates.
//!
//! Every retrieval path goes through a [`Reranker`]; when reranking is off
//! the [`PassThrough`] implementation just truncates to the final K.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::RerankerConfig;
use crate::error::Result;
use crate::llm::chat::{GenerationRequest, Generator};
use crate::llm::cross_encoder;
use crate::models::SourceChunk;

/// Characters of each candidate shown to an LLM judge.
const JUDGE_SNIPPET_CHARS: usize = 800;
const JUDGE_CONCURRENCY: usize = 4;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// How many first-pass candidates to fetch to produce `top_k` results.
    fn candidate_count(&self, top_k: usize) -> usize;

    /// Re-score `candidates` and return at most `top_k`, best first, each
    /// tagged with its 1-based rank before reranking.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SourceChunk>,
        top_k: usize,
    ) -> Result<Vec<SourceChunk>>;
}

/// No-op stage: keeps first-pass order.
pub struct PassThrough;

#[async_trait]
impl Reranker for PassThrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn candidate_count(&self, top_k: usize) -> usize {
        top_k
    }

    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<SourceChunk>,
        top_k: usize,
    ) -> Result<Vec<SourceChunk>> {
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

/// Rerank, falling back to first-pass order when the reranker fails.
pub async fn rerank_or_passthrough(
    reranker: &dyn Reranker,
    query: &str,
    candidates: Vec<SourceChunk>,
    top_k: usize,
) -> Vec<SourceChunk> {
    match reranker.rerank(query, candidates.clone(), top_k).await {
        Ok(ranked) => ranked,
        Err(e) => {
            tracing::warn!("{} reranker failed, keeping first-pass order: {e:#}", reranker.name());
            let mut fallback = candidates;
            fallback.truncate(top_k);
            fallback
        }
    }
}

/// Replace relevance with `scores[i]` for candidate `i`, drop anything under
/// `min_score`, sort and truncate.
fn apply_scores(
    candidates: Vec<SourceChunk>,
    scores: &[(usize, f32)],
    top_k: usize,
    min_score: f32,
) -> Vec<SourceChunk> {
    let mut slots: Vec<Option<SourceChunk>> = candidates.into_iter().map(Some).collect();
    let mut ranked: Vec<SourceChunk> = scores
        .iter()
        .filter(|(_, score)| *score >= min_score)
        .filter_map(|&(index, score)| {
            let mut chunk = slots.get_mut(index)?.take()?;
            chunk.original_rank = Some(index + 1);
            chunk.relevance_score = score;
            Some(chunk)
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.original_rank.cmp(&b.original_rank))
    });
    ranked.truncate(top_k);
    ranked
}

// ─── Cross-encoder ───────────────────────────────────────

pub struct CrossEncoderReranker {
    client: reqwest::Client,
    config: RerankerConfig,
}

impl CrossEncoderReranker {
    pub fn new(client: reqwest::Client, config: RerankerConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &'static str {
        "cross_encoder"
    }

    fn candidate_count(&self, top_k: usize) -> usize {
        self.config.candidate_count.max(top_k)
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SourceChunk>,
        top_k: usize,
    ) -> Result<Vec<SourceChunk>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let documents: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let results =
            cross_encoder::rerank(&self.client, &self.config, query, &documents, documents.len())
                .await?;
        let scores: Vec<(usize, f32)> = results.into_iter().map(|r| (r.index, r.score)).collect();
        Ok(apply_scores(candidates, &scores, top_k, self.config.min_score))
    }
}

// ─── LLM judge ───────────────────────────────────────────

/// Asks the chat model whether each candidate is relevant and turns the
/// verdict into a 0–1 score.
pub struct LlmReranker {
    generator: Arc<dyn Generator>,
    candidate_count: usize,
    min_score: f32,
}

impl LlmReranker {
    pub fn new(generator: Arc<dyn Generator>, config: &RerankerConfig) -> Self {
        Self {
            generator,
            candidate_count: config.candidate_count,
            min_score: config.min_score,
        }
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn candidate_count(&self, top_k: usize) -> usize {
        self.candidate_count.max(top_k)
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SourceChunk>,
        top_k: usize,
    ) -> Result<Vec<SourceChunk>> {
        let prompts: Vec<String> = candidates
            .iter()
            .map(|c| build_yesno_prompt(query, &c.text))
            .collect();

        let generator = &self.generator;
        let scores: Vec<(usize, f32)> = stream::iter(prompts.into_iter().enumerate())
            .map(|(i, prompt)| async move {
                let request = GenerationRequest::new(prompt, 0.0, 64);
                let score = match generator.complete(&request).await {
                    Ok(reply) => parse_relevance_score(&reply),
                    Err(e) => {
                        tracing::debug!("Relevance judgement {i} failed: {e:#}");
                        0.0
                    }
                };
                (i, score)
            })
            .buffered(JUDGE_CONCURRENCY)
            .collect()
            .await;

        Ok(apply_scores(candidates, &scores, top_k, self.min_score))
    }
}

fn build_yesno_prompt(query: &str, text: &str) -> String {
    let snippet: String = text.chars().take(JUDGE_SNIPPET_CHARS).collect();
    format!(
        "Judge whether the passage below helps answer the question. \
         Answer with ONLY a JSON object: {{\"relevant\": true/false, \"confidence\": 0.0-1.0}}\n\n\
         Question: {query}\n\nPassage:\n{snippet}"
    )
}

#[derive(Deserialize)]
struct RelevanceResponse {
    relevant: bool,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

fn parse_relevance_score(content: &str) -> f32 {
    let json = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => content,
    };
    if let Ok(v) = serde_json::from_str::<RelevanceResponse>(json) {
        let base = if v.relevant { 0.5 } else { 0.0 };
        return base + v.confidence.clamp(0.0, 1.0) * 0.5;
    }

    // Fallback: bare yes/no verdicts
    let lower = content.to_lowercase();
    let has_word = |w: &str| lower.split(|c: char| !c.is_alphanumeric()).any(|t| t == w);
    if has_word("yes") || (has_word("relevant") && !has_word("not")) {
        0.7
    } else if has_word("no") || has_word("not") {
        0.2
    } else {
        0.5
    }
}
