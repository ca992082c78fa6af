//! Corrective retrieval: evaluate the evidence, then use it, refine it,
//! or go looking for better evidence before answering.

pub mod evaluator;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::config::CorrectiveConfig;
use crate::error::Result;
use crate::llm::chat::Generator;
use crate::llm::query_expand::expand_query;
use crate::models::{ConfidenceCategory, ConfidenceEvaluation, SourceChunk};

use evaluator::ConfidenceEvaluator;

pub const UNCERTAINTY_PREFIX: &str = "Based on the available information: ";

/// Corrective steps, recorded on the evaluation in the order they ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectUse,
    AmbiguousHandling,
    KnowledgeRefinement,
    CorrectionTriggered,
    QueryExpansionSuccess,
    SourceMerging,
    LowRelevanceRefusal,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectUse => "direct_use",
            Strategy::AmbiguousHandling => "ambiguous_handling",
            Strategy::KnowledgeRefinement => "knowledge_refinement",
            Strategy::CorrectionTriggered => "correction_triggered",
            Strategy::QueryExpansionSuccess => "query_expansion_success",
            Strategy::SourceMerging => "source_merging",
            Strategy::LowRelevanceRefusal => "low_relevance_refusal",
        }
    }
}

impl ConfidenceEvaluation {
    pub fn record(&mut self, strategy: Strategy) {
        self.applied_strategies.push(strategy.as_str().to_string());
    }
}

/// Retrieval as seen by the corrective loop: query text in, final sources out.
#[async_trait]
pub trait SourceSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SourceChunk>>;
}

pub struct Corrected {
    pub sources: Vec<SourceChunk>,
    pub evaluation: ConfidenceEvaluation,
}

/// Runs the corrective strategy for one question.
pub struct CorrectiveRetrieval<'a> {
    pub config: &'a CorrectiveConfig,
    pub evaluator: &'a ConfidenceEvaluator,
    pub generator: &'a dyn Generator,
    pub top_k: usize,
}

impl CorrectiveRetrieval<'_> {
    /// Improve on the first retrieval round for `question`.
    ///
    /// Bookkeeping from earlier evaluations is carried over to the returned
    /// one. Retrieval failures during a retry fail the query.
    pub async fn correct(
        &self,
        search: &dyn SourceSearch,
        question: &str,
        sources: Vec<SourceChunk>,
        evaluation: ConfidenceEvaluation,
    ) -> Result<Corrected> {
        let mut sources = sources;
        let mut evaluation = evaluation;

        match evaluation.category {
            ConfidenceCategory::Correct => {
                evaluation.record(Strategy::DirectUse);
            }
            ConfidenceCategory::Ambiguous => {
                evaluation.record(Strategy::AmbiguousHandling);
                if self.config.knowledge_refinement && sources.len() > 2 {
                    sources = refine_knowledge(question, sources);
                    let fresh = self.evaluator.evaluate(question, &sources).await;
                    evaluation = carry_over(evaluation, fresh);
                    evaluation.record(Strategy::KnowledgeRefinement);
                }
            }
            ConfidenceCategory::Incorrect => {
                evaluation.record(Strategy::CorrectionTriggered);
                if self.config.query_expansion && self.config.max_retry_attempts > 0 {
                    (sources, evaluation) = self.expand(search, question, sources, evaluation).await?;
                }
            }
        }

        Ok(Corrected {
            sources,
            evaluation,
        })
    }

    async fn expand(
        &self,
        search: &dyn SourceSearch,
        question: &str,
        sources: Vec<SourceChunk>,
        evaluation: ConfidenceEvaluation,
    ) -> Result<(Vec<SourceChunk>, ConfidenceEvaluation)> {
        let expanded = match expand_query(self.generator, question).await {
            Ok(queries) => queries,
            Err(e) => {
                tracing::warn!("Query expansion failed, keeping first retrieval: {e:#}");
                Vec::new()
            }
        };
        if expanded.is_empty() {
            return Ok((sources, evaluation));
        }
        tracing::info!("Retrying retrieval with {} expanded queries", expanded.len());

        let mut best = evaluation;
        best.expanded_queries = expanded.clone();
        let mut rounds: Vec<Vec<SourceChunk>> = vec![sources];

        for query in expanded.iter().take(self.config.max_retry_attempts) {
            best.retries_performed += 1;
            let candidate = search.search(query).await?;
            let candidate_eval = self.evaluator.evaluate(query, &candidate).await;
            tracing::info!(
                "Retry {} with '{query}': top={:.3} {:?}",
                best.retries_performed,
                candidate_eval.top_score,
                candidate_eval.category
            );
            rounds.push(candidate.clone());

            if candidate_eval.top_score > best.top_score {
                best = carry_over(best, candidate_eval);
                best.record(Strategy::QueryExpansionSuccess);
                if best.category != ConfidenceCategory::Incorrect {
                    return Ok((candidate, best));
                }
            }
        }

        // Still weak: pool every phrasing's results, fetching those not tried yet
        for query in expanded.iter().skip(self.config.max_retry_attempts) {
            rounds.push(search.search(query).await?);
        }
        let merged = merge_sources(rounds, self.top_k);
        let fresh = self.evaluator.evaluate(question, &merged).await;
        let mut evaluation = carry_over(best, fresh);
        evaluation.record(Strategy::SourceMerging);
        Ok((merged, evaluation))
    }
}

/// Replace the scores of `previous` with those of `fresh`, keeping the
/// strategy trail, retry count and expansions.
fn carry_over(previous: ConfidenceEvaluation, fresh: ConfidenceEvaluation) -> ConfidenceEvaluation {
    ConfidenceEvaluation {
        applied_strategies: previous.applied_strategies,
        retries_performed: previous.retries_performed,
        expanded_queries: previous.expanded_queries,
        ..fresh
    }
}

/// Re-order sources by `0.7 * relevance + 0.3 * keyword overlap` and drop
/// the ones sharing no keyword with the query, as long as at least one does.
/// Reported relevance scores are left alone. Two sources or fewer are
/// returned untouched.
pub fn refine_knowledge(query: &str, sources: Vec<SourceChunk>) -> Vec<SourceChunk> {
    if sources.len() <= 2 {
        return sources;
    }
    let mut scored: Vec<(f32, f32, SourceChunk)> = sources
        .into_iter()
        .map(|chunk| {
            let overlap = keyword_overlap(query, &chunk.text);
            (chunk.relevance_score * 0.7 + overlap * 0.3, overlap, chunk)
        })
        .collect();

    if scored.iter().any(|(_, overlap, _)| *overlap > 0.0) {
        scored.retain(|(_, overlap, _)| *overlap > 0.0);
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().map(|(_, _, chunk)| chunk).collect()
}

/// Share of the query's words that appear in `text`. Only words longer than
/// three characters can match, but every word counts toward the total.
pub fn keyword_overlap(query: &str, text: &str) -> f32 {
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let matches = words
        .iter()
        .filter(|w| w.chars().count() > 3 && haystack.contains(w.as_str()))
        .count();
    matches as f32 / words.len() as f32
}

/// Union of several result lists keyed by `docId:chunkIndex`, keeping the
/// highest score per chunk, best first, truncated to `top_k`.
pub fn merge_sources(rounds: Vec<Vec<SourceChunk>>, top_k: usize) -> Vec<SourceChunk> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, SourceChunk> = HashMap::new();

    for chunk in rounds.into_iter().flatten() {
        let key = chunk.dedup_key();
        match best.get(&key) {
            Some(existing) if existing.relevance_score >= chunk.relevance_score => {}
            Some(_) => {
                best.insert(key, chunk);
            }
            None => {
                order.push(key.clone());
                best.insert(key, chunk);
            }
        }
    }

    let mut merged: Vec<SourceChunk> = order.into_iter().filter_map(|k| best.remove(&k)).collect();
    // Stable sort keeps first-seen order among equal scores
    merged.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(top_k);
    merged
}

/// Prefix an answer given under ambiguous evidence, unless it already hedges.
pub fn add_uncertainty_marker(answer: &str) -> String {
    if answer.starts_with("I don't") || answer.starts_with("I couldn't") {
        return answer.to_string();
    }
    let lower = answer.to_lowercase();
    let hedges = ["may ", "might ", "possibly", "it appears"];
    if hedges.iter().any(|h| lower.contains(h)) {
        return answer.to_string();
    }
    format!("{UNCERTAINTY_PREFIX}{answer}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfidenceConfig;
    use crate::error::RagError;
    use crate::llm::chat::{GenerationRequest, TokenStream};
    use parking_lot::Mutex;

    fn chunk(doc: &str, idx: usize, score: f32, text: &str) -> SourceChunk {
        SourceChunk {
            id: format!("{doc}-{idx}"),
            doc_id: doc.into(),
            chunk_index: idx,
            relevance_score: score,
            text: text.into(),
            title: None,
            rrf_score: None,
            original_rank: None,
        }
    }

    /// Canned retrieval results per query; records every query it sees.
    struct ScriptedSearch {
        results: HashMap<String, Vec<SourceChunk>>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SourceSearch for ScriptedSearch {
        async fn search(&self, query: &str) -> Result<Vec<SourceChunk>> {
            self.seen.lock().push(query.to_string());
            Ok(self.results.get(query).cloned().unwrap_or_default())
        }
    }

    struct Rewriter(&'static str);

    #[async_trait]
    impl Generator for Rewriter {
        async fn complete(&self, _: &GenerationRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
        async fn stream(&self, _: &GenerationRequest) -> Result<TokenStream> {
            Err(RagError::Generation("not used".into()))
        }
    }

    const REWRITES: &str = r#"["How are API requests throttled?", "What caps the request rate?"]"#;

    fn scripted(pairs: Vec<(&str, Vec<SourceChunk>)>) -> ScriptedSearch {
        ScriptedSearch {
            results: pairs.into_iter().map(|(q, s)| (q.to_string(), s)).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    async fn run(
        config: CorrectiveConfig,
        rewrites: &'static str,
        search: &ScriptedSearch,
        first: Vec<SourceChunk>,
    ) -> Corrected {
        let evaluator = ConfidenceEvaluator::new(ConfidenceConfig::default());
        let generator = Rewriter(rewrites);
        let question = "What is rate limiting?";
        let evaluation = evaluator.evaluate(question, &first).await;
        CorrectiveRetrieval {
            config: &config,
            evaluator: &evaluator,
            generator: &generator,
            top_k: 3,
        }
        .correct(search, question, first, evaluation)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_correct_evidence_is_used_directly() {
        let search = scripted(vec![]);
        let out = run(
            CorrectiveConfig::default(),
            REWRITES,
            &search,
            vec![chunk("a", 0, 0.9, "rate limiting")],
        )
        .await;
        assert_eq!(out.evaluation.applied_strategies, vec!["direct_use"]);
        assert!(search.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_evidence_is_refined() {
        let search = scripted(vec![]);
        let out = run(
            CorrectiveConfig::default(),
            REWRITES,
            &search,
            vec![
                chunk("a", 0, 0.75, "Office locations"),
                chunk("b", 0, 0.74, "Rate limiting caps requests"),
                chunk("c", 0, 0.72, "Holiday calendar"),
            ],
        )
        .await;
        assert_eq!(
            out.evaluation.applied_strategies,
            vec!["ambiguous_handling", "knowledge_refinement"]
        );
        assert_eq!(out.sources[0].doc_id, "b");
    }

    #[tokio::test]
    async fn test_expansion_recovers_weak_retrieval() {
        let search = scripted(vec![(
            "How are API requests throttled?",
            vec![chunk("runbook", 2, 0.86, "Throttling caps API requests")],
        )]);
        let out = run(
            CorrectiveConfig::default(),
            REWRITES,
            &search,
            vec![chunk("a", 0, 0.4, "unrelated")],
        )
        .await;

        assert_eq!(out.evaluation.category, ConfidenceCategory::Correct);
        assert_eq!(
            out.evaluation.applied_strategies,
            vec!["correction_triggered", "query_expansion_success"]
        );
        assert_eq!(out.evaluation.retries_performed, 1);
        assert_eq!(out.evaluation.expanded_queries.len(), 2);
        assert_eq!(out.sources[0].doc_id, "runbook");
        assert_eq!(*search.seen.lock(), vec!["How are API requests throttled?"]);
    }

    #[tokio::test]
    async fn test_failed_expansion_merges_all_rounds() {
        let search = scripted(vec![
            ("How are API requests throttled?", vec![chunk("b", 0, 0.5, "t")]),
            ("What caps the request rate?", vec![chunk("c", 0, 0.45, "t")]),
        ]);
        let out = run(
            CorrectiveConfig::default(),
            REWRITES,
            &search,
            vec![chunk("a", 0, 0.4, "t")],
        )
        .await;

        assert_eq!(out.evaluation.category, ConfidenceCategory::Incorrect);
        assert_eq!(
            out.evaluation.applied_strategies,
            vec!["correction_triggered", "query_expansion_success", "source_merging"]
        );
        // One retry, then the untried rewrite is fetched for merging
        assert_eq!(out.evaluation.retries_performed, 1);
        assert_eq!(search.seen.lock().len(), 2);
        let docs: Vec<&str> = out.sources.iter().map(|s| s.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_expansion_disabled() {
        let search = scripted(vec![]);
        let config = CorrectiveConfig {
            query_expansion: false,
            ..CorrectiveConfig::default()
        };
        let out = run(config, REWRITES, &search, vec![chunk("a", 0, 0.2, "t")]).await;
        assert_eq!(out.evaluation.applied_strategies, vec!["correction_triggered"]);
        assert!(search.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_rewrites_keep_first_round() {
        let search = scripted(vec![]);
        let out = run(
            CorrectiveConfig::default(),
            "ok",
            &search,
            vec![chunk("a", 0, 0.2, "t")],
        )
        .await;
        assert_eq!(out.evaluation.applied_strategies, vec!["correction_triggered"]);
        assert_eq!(out.sources[0].doc_id, "a");
    }

    #[test]
    fn test_keyword_overlap_counts_long_words_only() {
        // "what", "rate", "limiting" are > 3 chars; "is" counts toward the total only
        let overlap = keyword_overlap("What is rate limiting", "Rate limiting protects APIs");
        assert!((overlap - 0.5).abs() < 1e-6);
        assert_eq!(keyword_overlap("", "anything"), 0.0);
    }

    #[test]
    fn test_refine_knowledge_reorders_and_drops_unrelated() {
        let sources = vec![
            chunk("a", 0, 0.76, "Quarterly revenue figures"),
            chunk("b", 0, 0.70, "Token bucket rate limiting"),
            chunk("c", 0, 0.72, "Bucket sizes for storage"),
        ];
        let refined = refine_knowledge("token bucket limiting", sources);
        let docs: Vec<&str> = refined.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["b", "c"]);
        assert_eq!(refined[0].relevance_score, 0.70);
    }

    #[test]
    fn test_refine_knowledge_keeps_all_without_any_overlap() {
        let sources = vec![
            chunk("a", 0, 0.76, "x"),
            chunk("b", 0, 0.74, "y"),
            chunk("c", 0, 0.72, "z"),
        ];
        assert_eq!(refine_knowledge("token bucket limiting", sources.clone()), sources);
    }

    #[test]
    fn test_refine_knowledge_leaves_small_sets() {
        let sources = vec![chunk("a", 0, 0.76, "x"), chunk("b", 0, 0.74, "y")];
        assert_eq!(refine_knowledge("anything here", sources.clone()), sources);
    }

    #[test]
    fn test_merge_keeps_best_score_per_chunk() {
        let merged = merge_sources(
            vec![
                vec![chunk("a", 0, 0.4, "t"), chunk("b", 1, 0.3, "t")],
                vec![chunk("b", 1, 0.6, "t"), chunk("c", 0, 0.5, "t")],
            ],
            2,
        );
        let keys: Vec<String> = merged.iter().map(|c| c.dedup_key()).collect();
        assert_eq!(keys, vec!["b:1", "c:0"]);
        assert_eq!(merged[0].relevance_score, 0.6);
    }

    #[test]
    fn test_uncertainty_marker() {
        assert_eq!(
            add_uncertainty_marker("Requests are capped per minute."),
            "Based on the available information: Requests are capped per minute."
        );
        assert_eq!(
            add_uncertainty_marker("I don't have information about that."),
            "I don't have information about that."
        );
        assert_eq!(
            add_uncertainty_marker("Limits might differ per plan."),
            "Limits might differ per plan."
        );
        assert_eq!(
            add_uncertainty_marker("It appears the quota resets hourly."),
            "It appears the quota resets hourly."
        );
    }
}
