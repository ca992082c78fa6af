use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::models::{FusedResult, SearchHit, SourceChunk};
use crate::search::bm25::SparseIndex;
use crate::search::vector::DenseRetriever;

#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub dense_weight: f32,
    pub sparse_weight: f32,
    /// RRF smoothing constant
    pub rrf_k: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            dense_weight: 0.7,
            sparse_weight: 0.3,
            rrf_k: 60.0,
        }
    }
}

impl From<&RetrievalConfig> for FusionWeights {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            dense_weight: config.dense_weight,
            sparse_weight: config.sparse_weight,
            rrf_k: config.rrf_k,
        }
    }
}

/// Weighted reciprocal-rank fusion of a dense and a sparse list.
///
/// A hit at 1-based rank `r` in a list contributes `weight / (rrf_k + r)`;
/// a hit present in both lists gets both terms. Results are ordered by the
/// summed score, descending, and truncated to `limit`.
pub fn weighted_rrf_fusion(
    dense: &[SearchHit],
    sparse: &[SearchHit],
    weights: &FusionWeights,
    limit: usize,
) -> Vec<FusedResult> {
    let mut fused: HashMap<&str, FusedResult> = HashMap::new();

    for (rank, hit) in dense.iter().enumerate() {
        let contribution = weights.dense_weight / (weights.rrf_k + rank as f32 + 1.0);
        let entry = fused.entry(hit.id.as_str()).or_insert_with(|| empty_result(hit));
        if !entry.in_dense {
            entry.in_dense = true;
            entry.dense_score = Some(hit.score);
            entry.rrf_score += contribution;
        }
    }

    for (rank, hit) in sparse.iter().enumerate() {
        let contribution = weights.sparse_weight / (weights.rrf_k + rank as f32 + 1.0);
        let entry = fused.entry(hit.id.as_str()).or_insert_with(|| empty_result(hit));
        if !entry.in_sparse {
            entry.in_sparse = true;
            entry.sparse_score = Some(hit.score);
            entry.rrf_score += contribution;
        }
    }

    let mut results: Vec<FusedResult> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(limit);
    results
}

fn empty_result(hit: &SearchHit) -> FusedResult {
    FusedResult {
        id: hit.id.clone(),
        doc_id: hit.doc_id.clone(),
        chunk_index: hit.chunk_index,
        text: hit.text.clone(),
        title: hit.title.clone(),
        rrf_score: 0.0,
        dense_score: None,
        sparse_score: None,
        in_dense: false,
        in_sparse: false,
    }
}

/// First-stage retrieval: dense-only or fused hybrid.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn mode(&self) -> &'static str;

    async fn retrieve(
        &self,
        query: &str,
        vector: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SourceChunk>>;
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn mode(&self) -> &'static str {
        "dense"
    }

    async fn retrieve(
        &self,
        _query: &str,
        vector: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SourceChunk>> {
        let hits = self.search(vector, limit, category).await?;
        Ok(hits.into_iter().map(SourceChunk::from_hit).collect())
    }
}

/// Dense and lexical retrieval run side by side, then fused.
pub struct HybridRetriever {
    dense: Arc<DenseRetriever>,
    sparse: Arc<dyn SparseIndex>,
    weights: FusionWeights,
    degrade_on_sparse_failure: bool,
}

impl HybridRetriever {
    pub fn new(
        dense: Arc<DenseRetriever>,
        sparse: Arc<dyn SparseIndex>,
        weights: FusionWeights,
        degrade_on_sparse_failure: bool,
    ) -> Self {
        Self {
            dense,
            sparse,
            weights,
            degrade_on_sparse_failure,
        }
    }

    async fn sparse_search(&self, query: &str, k: usize, category: Option<&str>) -> Result<Vec<SearchHit>> {
        let sparse = self.sparse.clone();
        let query = query.to_string();
        let category = category.map(str::to_string);
        tokio::task::spawn_blocking(move || sparse.search(&query, k, category.as_deref()))
            .await
            .map_err(|e| RagError::Retrieval(format!("Lexical search task failed: {e}")))?
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    fn mode(&self) -> &'static str {
        "hybrid"
    }

    async fn retrieve(
        &self,
        query: &str,
        vector: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<SourceChunk>> {
        let per_list = limit.saturating_mul(2);
        let (dense, sparse) = tokio::join!(
            self.dense.search(vector, per_list, category),
            self.sparse_search(query, per_list, category),
        );

        let dense = dense?;
        let sparse = match sparse {
            Ok(hits) => hits,
            Err(e) if self.degrade_on_sparse_failure => {
                tracing::warn!("Lexical search failed, continuing with dense results only: {e:#}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            "Hybrid retrieval: {} dense + {} sparse candidates",
            dense.len(),
            sparse.len()
        );

        Ok(weighted_rrf_fusion(&dense, &sparse, &self.weights, limit)
            .into_iter()
            .map(SourceChunk::from_fused)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::bm25::SparseStats;
    use crate::search::vector::{ChunkPayload, InMemoryVectorStore, VectorPoint, VectorStore};

    fn make_hit(id: &str, score: f32) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            doc_id: format!("doc-{id}"),
            chunk_index: 0,
            text: format!("text of {id}"),
            title: None,
            score,
        }
    }

    fn equal_weights() -> FusionWeights {
        FusionWeights {
            dense_weight: 1.0,
            sparse_weight: 1.0,
            rrf_k: 60.0,
        }
    }

    #[test]
    fn test_single_list_scores() {
        let dense = vec![make_hit("a", 0.9), make_hit("b", 0.8)];
        let results = weighted_rrf_fusion(&dense, &[], &equal_weights(), 10);
        assert_eq!(results.len(), 2);
        assert!((results[0].rrf_score - 1.0 / 61.0).abs() < 1e-6);
        assert!((results[1].rrf_score - 1.0 / 62.0).abs() < 1e-6);
        assert!(results.iter().all(|r| r.in_dense && !r.in_sparse));
    }

    #[test]
    fn test_dual_signal_outranks_single_signal_top_hit() {
        // "a" is dense #1 only; "b" is dense #2 and sparse #1.
        // 1/62 + 1/61 > 1/61, so "b" must come first.
        let dense = vec![make_hit("a", 0.95), make_hit("b", 0.90)];
        let sparse = vec![make_hit("b", 12.0)];
        let results = weighted_rrf_fusion(&dense, &sparse, &equal_weights(), 10);

        assert_eq!(results[0].id, "b");
        assert_eq!(results[1].id, "a");
        assert!(results[0].in_dense && results[0].in_sparse);
        assert!((results[0].rrf_score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-6);
        assert!((results[1].rrf_score - 1.0 / 61.0).abs() < 1e-6);
        assert_eq!(results[0].dense_score, Some(0.90));
        assert_eq!(results[0].sparse_score, Some(12.0));
    }

    #[test]
    fn test_weights_scale_contributions() {
        let weights = FusionWeights::default();
        let dense = vec![make_hit("a", 0.9)];
        let sparse = vec![make_hit("b", 3.0)];
        let results = weighted_rrf_fusion(&dense, &sparse, &weights, 10);
        assert_eq!(results[0].id, "a");
        assert!((results[0].rrf_score - 0.7 / 61.0).abs() < 1e-6);
        assert!((results[1].rrf_score - 0.3 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_truncates_to_limit() {
        let dense: Vec<SearchHit> = (0..10).map(|i| make_hit(&format!("d{i}"), 0.5)).collect();
        let sparse: Vec<SearchHit> = (0..10).map(|i| make_hit(&format!("s{i}"), 1.0)).collect();
        let results = weighted_rrf_fusion(&dense, &sparse, &equal_weights(), 5);
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].rrf_score >= pair[1].rrf_score);
        }
    }

    #[test]
    fn test_duplicate_within_a_list_counts_once() {
        let dense = vec![make_hit("a", 0.9), make_hit("a", 0.9)];
        let results = weighted_rrf_fusion(&dense, &[], &equal_weights(), 10);
        assert_eq!(results.len(), 1);
        assert!((results[0].rrf_score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(weighted_rrf_fusion(&[], &[], &equal_weights(), 10).is_empty());
    }

    struct FailingSparse;

    impl SparseIndex for FailingSparse {
        fn index(&self, _: &[crate::search::bm25::SparseDocument]) -> Result<()> {
            Ok(())
        }
        fn search(&self, _: &str, _: usize, _: Option<&str>) -> Result<Vec<SearchHit>> {
            Err(RagError::Retrieval("index poisoned".into()))
        }
        fn remove_document(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn stats(&self) -> SparseStats {
            SparseStats::default()
        }
    }

    async fn dense_with_one_point() -> Arc<DenseRetriever> {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .upsert(vec![VectorPoint {
                id: "p".into(),
                vector: vec![1.0, 0.0],
                payload: ChunkPayload {
                    doc_id: "doc".into(),
                    chunk_index: 0,
                    text: "rate limiting".into(),
                    categories: vec![],
                    title: None,
                },
            }])
            .await
            .unwrap();
        Arc::new(DenseRetriever::new(store, 16))
    }

    #[tokio::test]
    async fn test_sparse_failure_degrades_to_dense() {
        let retriever = HybridRetriever::new(
            dense_with_one_point().await,
            Arc::new(FailingSparse),
            FusionWeights::default(),
            true,
        );
        let sources = retriever.retrieve("rate", &[1.0, 0.0], 3, None).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert!((sources[0].relevance_score - 1.0).abs() < 1e-6);
        assert!(sources[0].rrf_score.is_some());
    }

    #[tokio::test]
    async fn test_sparse_failure_can_fail_query() {
        let retriever = HybridRetriever::new(
            dense_with_one_point().await,
            Arc::new(FailingSparse),
            FusionWeights::default(),
            false,
        );
        let err = retriever.retrieve("rate", &[1.0, 0.0], 3, None).await.unwrap_err();
        assert!(matches!(err, RagError::Retrieval(_)));
    }
}
