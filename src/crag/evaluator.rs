//! Retrieval confidence: how far the final sources can be trusted.
//!
//! The category is driven by the top relevance score against two
//! thresholds. For a top score inside the ambiguous band an optional LLM
//! judgement can move it either way. `confidence_score` is a finer-grained
//! heuristic reported next to the category.

use std::sync::Arc;

use crate::config::ConfidenceConfig;
use crate::llm::chat::{GenerationRequest, Generator};
use crate::models::{top_relevance, ConfidenceCategory, ConfidenceEvaluation, SourceChunk};

const JUDGE_DOCUMENTS: usize = 3;
const JUDGE_SNIPPET_CHARS: usize = 500;
/// Neutral judgement used when the judge's reply cannot be read.
const JUDGE_FALLBACK: f32 = 0.5;
const JUDGE_WEIGHT: f32 = 0.4;

const GAP_THRESHOLD: f32 = 0.15;

pub struct ConfidenceEvaluator {
    config: ConfidenceConfig,
    judge: Option<Arc<dyn Generator>>,
}

impl ConfidenceEvaluator {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self {
            config,
            judge: None,
        }
    }

    /// Use `judge` for LLM-assisted judgement when `llm_evaluation` is on.
    pub fn with_judge(mut self, judge: Arc<dyn Generator>) -> Self {
        if self.config.llm_evaluation {
            self.judge = Some(judge);
        }
        self
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    pub fn classify(&self, score: f32) -> ConfidenceCategory {
        if score >= self.config.high_confidence_score {
            ConfidenceCategory::Correct
        } else if score >= self.config.min_relevance_score {
            ConfidenceCategory::Ambiguous
        } else {
            ConfidenceCategory::Incorrect
        }
    }

    pub async fn evaluate(&self, query: &str, sources: &[SourceChunk]) -> ConfidenceEvaluation {
        if sources.is_empty() {
            return ConfidenceEvaluation {
                confidence_score: 0.0,
                top_score: 0.0,
                category: ConfidenceCategory::Incorrect,
                reason: "No results retrieved".to_string(),
                applied_strategies: Vec::new(),
                retries_performed: 0,
                expanded_queries: Vec::new(),
            };
        }

        let top = top_relevance(sources);
        let stats = ScoreStats::of(sources);
        let mut category = self.classify(top);
        let mut confidence = heuristic_confidence(&stats);

        let mut judged = None;
        if category == ConfidenceCategory::Ambiguous {
            if let Some(judge) = &self.judge {
                let llm = judge_relevance(judge.as_ref(), query, sources).await;
                let effective = (1.0 - JUDGE_WEIGHT) * top + JUDGE_WEIGHT * llm;
                category = self.classify(effective);
                confidence = ((1.0 - JUDGE_WEIGHT) * confidence + JUDGE_WEIGHT * llm).clamp(0.0, 1.0);
                judged = Some(llm);
            }
        }

        let reason = describe(top, &stats, judged);
        tracing::info!(
            "Confidence {:?}: top={top:.3} mean={:.3} variance={:.4} confidence={confidence:.3}",
            category,
            stats.mean,
            stats.variance
        );

        ConfidenceEvaluation {
            confidence_score: confidence,
            top_score: top,
            category,
            reason,
            applied_strategies: Vec::new(),
            retries_performed: 0,
            expanded_queries: Vec::new(),
        }
    }
}

struct ScoreStats {
    top: f32,
    mean: f32,
    variance: f32,
    gap: f32,
    count: usize,
}

impl ScoreStats {
    fn of(sources: &[SourceChunk]) -> Self {
        let mut scores: Vec<f32> = sources.iter().map(|s| s.relevance_score).collect();
        scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        let count = scores.len();
        let top = scores.first().copied().unwrap_or(0.0);
        let mean = scores.iter().sum::<f32>() / count.max(1) as f32;
        let variance = if count < 2 {
            0.0
        } else {
            scores.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / count as f32
        };
        let gap = match scores.get(1) {
            Some(second) => top - second,
            None => top,
        };

        Self {
            top,
            mean,
            variance,
            gap,
            count,
        }
    }
}

fn heuristic_confidence(stats: &ScoreStats) -> f32 {
    let gap_bonus = if stats.gap > GAP_THRESHOLD {
        (stats.gap * 0.3).min(0.1)
    } else {
        0.0
    };
    let variance_penalty = (stats.variance * 0.5).min(0.2);
    let consistency_bonus = if stats.mean > 0.6 && stats.variance < 0.05 {
        0.05
    } else {
        0.0
    };
    let count_penalty = if stats.count < 3 { 0.05 } else { 0.0 };

    (stats.top + gap_bonus - variance_penalty + consistency_bonus - count_penalty).clamp(0.0, 1.0)
}

fn describe(top: f32, stats: &ScoreStats, judged: Option<f32>) -> String {
    let mut reason = format!("Top relevance score: {top:.3}, Average: {:.3}", stats.mean);
    if stats.variance > 0.05 {
        reason.push_str(" (high variance indicates inconsistent results)");
    }
    if let Some(llm) = judged {
        reason.push_str(&format!(", LLM verification: {:.1}/10", llm * 10.0));
    }
    reason
}

async fn judge_relevance(judge: &dyn Generator, query: &str, sources: &[SourceChunk]) -> f32 {
    let mut documents = String::new();
    for (i, source) in sources.iter().take(JUDGE_DOCUMENTS).enumerate() {
        let snippet: String = source.text.chars().take(JUDGE_SNIPPET_CHARS).collect();
        documents.push_str(&format!("Document {}:\n{snippet}\n\n", i + 1));
    }

    let prompt = format!(
        "You are evaluating the relevance of retrieved documents to a user's query.\n\n\
         Query: {query}\n\n\
         Retrieved Documents:\n{documents}\
         Rate the overall relevance of these documents to the query on a scale of 0 to 10:\n\
         - 0-3: not relevant to the query\n\
         - 4-6: somewhat relevant but may not fully answer the query\n\
         - 7-10: highly relevant and likely contain the answer\n\n\
         Respond with ONLY a single number from 0 to 10, nothing else."
    );

    match judge.complete(&GenerationRequest::new(prompt, 0.1, 10)).await {
        Ok(reply) => parse_judgement(&reply).unwrap_or_else(|| {
            tracing::warn!("Unreadable relevance judgement {reply:?}, using neutral score");
            JUDGE_FALLBACK
        }),
        Err(e) => {
            tracing::warn!("Relevance judgement failed: {e:#}");
            JUDGE_FALLBACK
        }
    }
}

/// A 0–10 rating scaled to 0–1.
fn parse_judgement(reply: &str) -> Option<f32> {
    let number: String = reply
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f32 = number.trim_end_matches('.').parse().ok()?;
    Some((value / 10.0).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::llm::chat::TokenStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source(score: f32) -> SourceChunk {
        SourceChunk {
            id: String::new(),
            doc_id: "doc".into(),
            chunk_index: 0,
            relevance_score: score,
            text: "Rate limiting caps how many requests a client may send.".into(),
            title: None,
            rrf_score: None,
            original_rank: None,
        }
    }

    struct FixedJudge {
        reply: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for FixedJudge {
        async fn complete(&self, _: &GenerationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.to_string())
        }
        async fn stream(&self, _: &GenerationRequest) -> Result<TokenStream> {
            unreachable!("the judge never streams")
        }
    }

    fn judged(reply: &'static str) -> (ConfidenceEvaluator, Arc<FixedJudge>) {
        let judge = Arc::new(FixedJudge {
            reply,
            calls: AtomicUsize::new(0),
        });
        let config = ConfidenceConfig {
            llm_evaluation: true,
            ..ConfidenceConfig::default()
        };
        (ConfidenceEvaluator::new(config).with_judge(judge.clone()), judge)
    }

    #[test]
    fn test_classification_boundaries() {
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig::default());
        assert_eq!(evaluator.classify(0.8), ConfidenceCategory::Correct);
        assert_eq!(evaluator.classify(0.95), ConfidenceCategory::Correct);
        assert_eq!(evaluator.classify(0.79), ConfidenceCategory::Ambiguous);
        assert_eq!(evaluator.classify(0.7), ConfidenceCategory::Ambiguous);
        assert_eq!(evaluator.classify(0.69), ConfidenceCategory::Incorrect);
        assert_eq!(evaluator.classify(0.0), ConfidenceCategory::Incorrect);
    }

    #[tokio::test]
    async fn test_empty_sources_are_incorrect() {
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig::default());
        let eval = evaluator.evaluate("q", &[]).await;
        assert_eq!(eval.category, ConfidenceCategory::Incorrect);
        assert_eq!(eval.confidence_score, 0.0);
        assert_eq!(eval.reason, "No results retrieved");
    }

    #[tokio::test]
    async fn test_top_score_drives_category_regardless_of_order() {
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig::default());
        // Fused order puts a lexical-only hit (0.0) first
        let eval = evaluator
            .evaluate("q", &[source(0.0), source(0.85), source(0.6)])
            .await;
        assert_eq!(eval.top_score, 0.85);
        assert_eq!(eval.category, ConfidenceCategory::Correct);
    }

    #[test]
    fn test_heuristic_adjustments() {
        // Consistent high scores: +0.05, no penalties
        let stats = ScoreStats::of(&[source(0.8), source(0.78), source(0.76)]);
        assert!((heuristic_confidence(&stats) - 0.85).abs() < 1e-3);

        // Single result: gap = top, so bonus 0.1; count penalty 0.05; consistency 0.05
        let stats = ScoreStats::of(&[source(0.7)]);
        assert!((heuristic_confidence(&stats) - 0.8).abs() < 1e-3);

        // Clamped to 1.0
        let stats = ScoreStats::of(&[source(1.0), source(0.99), source(0.98)]);
        assert_eq!(heuristic_confidence(&stats), 1.0);
    }

    #[test]
    fn test_parse_judgement() {
        assert_eq!(parse_judgement("7"), Some(0.7));
        assert_eq!(parse_judgement(" 8.5\n"), Some(0.85));
        assert_eq!(parse_judgement("Score: 10"), Some(1.0));
        assert_eq!(parse_judgement("12"), Some(1.0));
        assert_eq!(parse_judgement("no idea"), None);
    }

    #[tokio::test]
    async fn test_judge_only_consulted_in_ambiguous_band() {
        let (evaluator, judge) = judged("9");
        evaluator.evaluate("q", &[source(0.9)]).await;
        evaluator.evaluate("q", &[source(0.3)]).await;
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);

        let eval = evaluator.evaluate("q", &[source(0.75)]).await;
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        // 0.6 * 0.75 + 0.4 * 0.9 = 0.81
        assert_eq!(eval.category, ConfidenceCategory::Correct);
        assert!(eval.reason.contains("LLM verification: 9.0/10"));
    }

    #[tokio::test]
    async fn test_judge_can_demote() {
        let (evaluator, _) = judged("1");
        // 0.6 * 0.72 + 0.4 * 0.1 = 0.472
        let eval = evaluator.evaluate("q", &[source(0.72)]).await;
        assert_eq!(eval.category, ConfidenceCategory::Incorrect);
    }

    #[tokio::test]
    async fn test_unreadable_judgement_is_neutral() {
        let (evaluator, _) = judged("it depends");
        // 0.6 * 0.75 + 0.4 * 0.5 = 0.65
        let eval = evaluator.evaluate("q", &[source(0.75)]).await;
        assert_eq!(eval.category, ConfidenceCategory::Incorrect);
        assert!(eval.reason.contains("5.0/10"));
    }

    #[test]
    fn test_judge_ignored_when_disabled() {
        let judge = Arc::new(FixedJudge {
            reply: "10",
            calls: AtomicUsize::new(0),
        });
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig::default()).with_judge(judge);
        assert!(evaluator.judge.is_none());
    }
}
