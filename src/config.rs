use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    pub bind_addr: String,
    /// Overall timeout for every outbound HTTP call
    pub http_timeout_secs: u64,
    /// Embedding and chat model configuration
    pub llm: LlmConfig,
    pub vector_store: VectorStoreConfig,
    pub chunking: ChunkingConfig,
    /// Size of the embedding semaphore
    pub max_concurrent_embeddings: usize,
    pub retrieval: RetrievalConfig,
    pub reranker: RerankerConfig,
    pub confidence: ConfidenceConfig,
    pub corrective: CorrectiveConfig,
    pub cache: CacheConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "ollama" or "openai"
    pub provider: String,
    /// Base URL for the LLM API
    pub base_url: String,
    /// Model name for answers, query expansion and LLM judgements
    pub chat_model: String,
    /// Model name for embeddings
    pub embedding_model: String,
    /// API key (only needed for cloud providers)
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorStoreKind {
    Qdrant,
    /// Process-local store, mostly for development and tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub kind: VectorStoreKind,
    pub qdrant_url: String,
    pub collection: String,
    /// Points per upsert request
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    /// Run the lexical index next to the vector store and fuse both lists
    pub hybrid_enabled: bool,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub rrf_k: f32,
    /// When the lexical side fails, answer from the dense list alone
    pub degrade_on_sparse_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankerProvider {
    None,
    /// llama-server / TEI style `/v1/rerank` endpoint
    CrossEncoder,
    /// Yes/no judgement through the chat model
    Llm,
}

/// Configuration for the second-pass reranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    pub provider: RerankerProvider,
    /// Base URL for the cross-encoder API (e.g. "http://127.0.0.1:8082").
    pub base_url: Option<String>,
    /// Model name to send in the rerank request.
    pub model: Option<String>,
    /// How many fused candidates are handed to the reranker.
    pub candidate_count: usize,
    /// Reranked results scoring below this are dropped.
    pub min_score: f32,
    /// Request timeout in seconds (capped at 30).
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Hard floor: below this the query is refused
    pub min_relevance_score: f32,
    /// At or above this the evidence is treated as correct
    pub high_confidence_score: f32,
    /// Ask the chat model to rate ambiguous retrievals
    pub llm_evaluation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectiveConfig {
    pub enabled: bool,
    pub query_expansion: bool,
    pub knowledge_refinement: bool,
    pub max_retry_attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Stop admitting new entries once the cache is full
    Skip,
    /// Evict the oldest inserted entry to make room
    Oldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Minimum top relevance score for a result to be cached
    pub quality_threshold: f32,
    pub eviction: EvictionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Maximum silence between streamed events before the stream is ended
    pub stream_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            http_timeout_secs: 120,
            llm: LlmConfig::default(),
            vector_store: VectorStoreConfig::default(),
            chunking: ChunkingConfig::default(),
            max_concurrent_embeddings: 4,
            retrieval: RetrievalConfig::default(),
            reranker: RerankerConfig::default(),
            confidence: ConfidenceConfig::default(),
            corrective: CorrectiveConfig::default(),
            cache: CacheConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            api_key: None,
        }
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: VectorStoreKind::Qdrant,
            qdrant_url: "http://localhost:6333".to_string(),
            collection: "knowledge_base".to_string(),
            batch_size: 64,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1200,
            overlap_chars: 150,
            min_chars: 200,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            hybrid_enabled: true,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            rrf_k: 60.0,
            degrade_on_sparse_failure: true,
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: RerankerProvider::None,
            base_url: None,
            model: None,
            candidate_count: 20,
            min_score: 0.0,
            timeout_secs: 30,
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            min_relevance_score: 0.7,
            high_confidence_score: 0.8,
            llm_evaluation: false,
        }
    }
}

impl Default for CorrectiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            query_expansion: true,
            knowledge_refinement: true,
            max_retry_attempts: 1,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            quality_threshold: 0.65,
            eviction: EvictionPolicy::Skip,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 512,
            stream_idle_timeout_secs: 60,
        }
    }
}

impl FromStr for VectorStoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" | "in_memory" => Ok(Self::Memory),
            other => Err(format!("unknown vector store: {other}")),
        }
    }
}

impl FromStr for RerankerProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "cross_encoder" | "cross-encoder" | "local" => Ok(Self::CrossEncoder),
            "llm" => Ok(Self::Llm),
            other => Err(format!("unknown reranker provider: {other}")),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "oldest" | "fifo" => Ok(Self::Oldest),
            other => Err(format!("unknown eviction policy: {other}")),
        }
    }
}

/// Overwrite `target` with the parsed value of `key`, keeping the default on
/// a missing or unparseable variable.
fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = std::env::var(key) {
        if let Ok(v) = val.trim().parse() {
            *target = v;
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
        config.bind_addr = format!("{host}:{port}");
        env_parse("RAG_HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs);

        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(model) = std::env::var("LLM_EMBEDDING_MODEL") {
            config.llm.embedding_model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }

        env_parse("VECTOR_STORE", &mut config.vector_store.kind);
        if let Ok(url) = std::env::var("QDRANT_URL") {
            config.vector_store.qdrant_url = url;
        }
        if let Ok(name) = std::env::var("QDRANT_COLLECTION") {
            config.vector_store.collection = name;
        }
        env_parse("QDRANT_BATCH_SIZE", &mut config.vector_store.batch_size);

        env_parse("RAG_CHUNK_MAX_CHARS", &mut config.chunking.max_chars);
        env_parse("RAG_CHUNK_OVERLAP_CHARS", &mut config.chunking.overlap_chars);
        env_parse("RAG_CHUNK_MIN_CHARS", &mut config.chunking.min_chars);

        env_parse(
            "RAG_MAX_CONCURRENT_EMBEDDINGS",
            &mut config.max_concurrent_embeddings,
        );

        env_parse("RAG_DEFAULT_TOP_K", &mut config.retrieval.default_top_k);
        env_parse("RAG_HYBRID_ENABLED", &mut config.retrieval.hybrid_enabled);
        env_parse("RAG_DENSE_WEIGHT", &mut config.retrieval.dense_weight);
        env_parse("RAG_SPARSE_WEIGHT", &mut config.retrieval.sparse_weight);
        env_parse("RAG_RRF_K", &mut config.retrieval.rrf_k);
        env_parse(
            "RAG_DEGRADE_ON_SPARSE_FAILURE",
            &mut config.retrieval.degrade_on_sparse_failure,
        );

        // Reranker config
        env_parse("RERANKER_PROVIDER", &mut config.reranker.provider);
        if let Ok(url) = std::env::var("RERANKER_BASE_URL") {
            config.reranker.base_url = Some(url);
            if config.reranker.provider == RerankerProvider::None
                && std::env::var("RERANKER_PROVIDER").is_err()
            {
                config.reranker.provider = RerankerProvider::CrossEncoder;
            }
        }
        if let Ok(model) = std::env::var("RERANKER_MODEL") {
            config.reranker.model = Some(model);
        }
        env_parse("RERANKER_CANDIDATES", &mut config.reranker.candidate_count);
        env_parse("RERANKER_MIN_SCORE", &mut config.reranker.min_score);
        if let Ok(val) = std::env::var("RERANKER_TIMEOUT_SECS") {
            if let Ok(v) = val.parse::<u64>() {
                config.reranker.timeout_secs = v.min(30); // Cap at 30s
            }
        }

        env_parse(
            "RAG_MIN_RELEVANCE_SCORE",
            &mut config.confidence.min_relevance_score,
        );
        env_parse(
            "RAG_HIGH_CONFIDENCE_SCORE",
            &mut config.confidence.high_confidence_score,
        );
        env_parse("RAG_LLM_EVALUATION", &mut config.confidence.llm_evaluation);

        env_parse("CRAG_ENABLED", &mut config.corrective.enabled);
        env_parse("CRAG_QUERY_EXPANSION", &mut config.corrective.query_expansion);
        env_parse(
            "CRAG_KNOWLEDGE_REFINEMENT",
            &mut config.corrective.knowledge_refinement,
        );
        env_parse(
            "CRAG_MAX_RETRY_ATTEMPTS",
            &mut config.corrective.max_retry_attempts,
        );

        env_parse("RAG_CACHE_CAPACITY", &mut config.cache.capacity);
        env_parse(
            "RAG_CACHE_QUALITY_THRESHOLD",
            &mut config.cache.quality_threshold,
        );
        env_parse("RAG_CACHE_EVICTION", &mut config.cache.eviction);

        env_parse("RAG_ANSWER_TEMPERATURE", &mut config.generation.temperature);
        env_parse("RAG_ANSWER_MAX_TOKENS", &mut config.generation.max_tokens);
        env_parse(
            "RAG_STREAM_IDLE_TIMEOUT_SECS",
            &mut config.generation.stream_idle_timeout_secs,
        );

        config
    }

    /// Reject combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;

        if self.max_concurrent_embeddings == 0 {
            return Err(RagError::Config(
                "max_concurrent_embeddings must be at least 1".into(),
            ));
        }
        if self.vector_store.batch_size == 0 {
            return Err(RagError::Config("batch_size must be at least 1".into()));
        }
        if self.retrieval.default_top_k == 0 {
            return Err(RagError::Config("default_top_k must be at least 1".into()));
        }
        if self.retrieval.dense_weight < 0.0 || self.retrieval.sparse_weight < 0.0 {
            return Err(RagError::Config("fusion weights must be non-negative".into()));
        }
        let c = &self.confidence;
        if !(0.0..=1.0).contains(&c.min_relevance_score)
            || !(0.0..=1.0).contains(&c.high_confidence_score)
            || c.min_relevance_score > c.high_confidence_score
        {
            return Err(RagError::Config(format!(
                "confidence thresholds must satisfy 0 <= floor ({}) <= high ({}) <= 1",
                c.min_relevance_score, c.high_confidence_score
            )));
        }
        Ok(())
    }
}

impl ChunkingConfig {
    /// Window left for fresh text once the overlap prefix and its separator
    /// are accounted for.
    pub fn body_budget(&self) -> usize {
        if self.overlap_chars == 0 {
            self.max_chars
        } else {
            self.max_chars.saturating_sub(self.overlap_chars + 1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(RagError::Config("max_chars must be positive".into()));
        }
        let budget = self.body_budget();
        if budget < 4 {
            return Err(RagError::Config(format!(
                "overlap_chars ({}) leaves no room in max_chars ({})",
                self.overlap_chars, self.max_chars
            )));
        }
        // A window cut must always be able to satisfy the minimum.
        if self.min_chars * 2 + 2 > budget {
            return Err(RagError::Config(format!(
                "min_chars ({}) is too large for a {budget}-char window",
                self.min_chars
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.capacity, 500);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert!(config.cache.quality_threshold < config.confidence.min_relevance_score);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.confidence.min_relevance_score = 0.9;
        config.confidence.high_confidence_score = 0.5;
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_chunking_window_checks() {
        let ok = ChunkingConfig {
            max_chars: 100,
            overlap_chars: 10,
            min_chars: 20,
        };
        assert_eq!(ok.body_budget(), 89);
        assert!(ok.validate().is_ok());

        let overlap_too_big = ChunkingConfig {
            max_chars: 100,
            overlap_chars: 99,
            min_chars: 0,
        };
        assert!(overlap_too_big.validate().is_err());

        let min_too_big = ChunkingConfig {
            max_chars: 100,
            overlap_chars: 10,
            min_chars: 60,
        };
        assert!(min_too_big.validate().is_err());
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!(
            "cross-encoder".parse::<RerankerProvider>(),
            Ok(RerankerProvider::CrossEncoder)
        );
        assert_eq!("none".parse::<RerankerProvider>(), Ok(RerankerProvider::None));
        assert_eq!("oldest".parse::<EvictionPolicy>(), Ok(EvictionPolicy::Oldest));
        assert_eq!("memory".parse::<VectorStoreKind>(), Ok(VectorStoreKind::Memory));
        assert!("redis".parse::<VectorStoreKind>().is_err());
    }
}
