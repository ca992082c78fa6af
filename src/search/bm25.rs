use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy};

use crate::error::{RagError, Result};
use crate::models::{Chunk, SearchHit};

/// Extra candidates fetched per requested hit when a category post-filter
/// will discard some of them.
const POST_FILTER_FANOUT: usize = 8;

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Query terms that carry no retrieval signal.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "has", "have", "been", "were", "they", "this", "that", "with", "from", "will",
    "would", "there", "their", "what", "about", "which", "when", "make", "like", "time", "just",
    "know", "take", "into", "year", "your", "some", "could", "them", "than", "then", "now",
    "look", "only", "come", "its", "over", "also", "back", "after", "use", "two", "how",
    "first", "well", "way", "even", "new", "want", "because", "any", "these", "give", "most",
    "being",
];

/// A chunk as the lexical index sees it.
#[derive(Debug, Clone)]
pub struct SparseDocument {
    pub id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub title: Option<String>,
    pub categories: Vec<String>,
}

impl SparseDocument {
    pub fn from_chunk(id: String, chunk: &Chunk) -> Self {
        Self {
            id,
            doc_id: chunk.doc_id.clone(),
            chunk_index: chunk.chunk_index,
            text: chunk.text.clone(),
            title: chunk.title.clone(),
            categories: chunk.categories.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SparseStats {
    pub total_chunks: usize,
    pub total_documents: usize,
    pub average_chunk_chars: f64,
}

/// Process-local lexical index. Rebuilt by re-ingestion after a restart.
pub trait SparseIndex: Send + Sync {
    /// Add or replace chunks, keyed by their stable id.
    fn index(&self, docs: &[SparseDocument]) -> Result<()>;

    fn search(&self, query: &str, k: usize, category: Option<&str>) -> Result<Vec<SearchHit>>;

    /// Drop every chunk of `doc_id`; returns whether anything was indexed for it.
    fn remove_document(&self, doc_id: &str) -> Result<bool>;

    fn clear(&self) -> Result<()>;

    fn stats(&self) -> SparseStats;
}

#[derive(Debug, Clone)]
struct ChunkMeta {
    doc_id: String,
    categories: Vec<String>,
    chars: usize,
}

/// BM25 index held in RAM by tantivy.
///
/// One writer sits behind a mutex; searches go through a shared reader that
/// is reloaded after every commit, so readers never wait on each other.
pub struct Bm25Index {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    /// chunkId -> categories for post-filtering, plus bookkeeping for stats
    chunk_meta: RwLock<HashMap<String, ChunkMeta>>,
    f_chunk_id: Field,
    f_doc_id: Field,
    f_chunk_index: Field,
    f_text: Field,
    f_title: Field,
}

impl Bm25Index {
    pub fn new() -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let f_chunk_id = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let f_doc_id = schema_builder.add_text_field("doc_id", STRING | STORED);
        let f_chunk_index =
            schema_builder.add_u64_field("chunk_index", NumericOptions::default() | STORED);
        let f_text = schema_builder.add_text_field("text", TEXT | STORED);
        let f_title = schema_builder.add_text_field("title", STORED);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(|e| RagError::Retrieval(format!("Failed to create index writer: {e}")))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| RagError::Retrieval(format!("Failed to create reader: {e}")))?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            chunk_meta: RwLock::new(HashMap::new()),
            f_chunk_id,
            f_doc_id,
            f_chunk_index,
            f_text,
            f_title,
        })
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer
            .commit()
            .map_err(|e| RagError::Retrieval(format!("Failed to commit index: {e}")))?;
        self.reader
            .reload()
            .map_err(|e| RagError::Retrieval(format!("Failed to reload reader: {e}")))
    }

    /// Lower-cased query terms, minus stopwords and very short tokens.
    fn query_terms(&self, query: &str) -> Result<Vec<String>> {
        let mut analyzer = self
            .index
            .tokenizer_for_field(self.f_text)
            .map_err(RagError::retrieval)?;
        let mut stream = analyzer.token_stream(query);
        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        while stream.advance() {
            let text = stream.token().text.clone();
            if text.chars().count() <= 2 || STOPWORDS.contains(&text.as_str()) {
                continue;
            }
            if seen.insert(text.clone()) {
                terms.push(text);
            }
        }
        Ok(terms)
    }

    fn matches_category(&self, chunk_id: &str, category: Option<&str>) -> bool {
        let Some(cat) = category else {
            return true;
        };
        self.chunk_meta
            .read()
            .get(chunk_id)
            .is_some_and(|m| m.categories.iter().any(|c| c == cat))
    }
}

impl SparseIndex for Bm25Index {
    fn index(&self, docs: &[SparseDocument]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        for d in docs {
            writer.delete_term(tantivy::Term::from_field_text(self.f_chunk_id, &d.id));

            let mut doc = TantivyDocument::default();
            doc.add_text(self.f_chunk_id, &d.id);
            doc.add_text(self.f_doc_id, &d.doc_id);
            doc.add_u64(self.f_chunk_index, d.chunk_index as u64);
            doc.add_text(self.f_text, &d.text);
            if let Some(title) = &d.title {
                doc.add_text(self.f_title, title);
            }
            writer
                .add_document(doc)
                .map_err(|e| RagError::Retrieval(format!("Failed to add document: {e}")))?;
        }

        {
            let mut meta = self.chunk_meta.write();
            for d in docs {
                meta.insert(
                    d.id.clone(),
                    ChunkMeta {
                        doc_id: d.doc_id.clone(),
                        categories: d.categories.clone(),
                        chars: d.text.chars().count(),
                    },
                );
            }
        }

        self.commit(&mut writer)
    }

    fn search(&self, query: &str, k: usize, category: Option<&str>) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let terms = self.query_terms(query)?;
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| {
                let term = tantivy::Term::from_field_text(self.f_text, t);
                let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, q)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let fetch = if category.is_some() {
            k.saturating_mul(POST_FILTER_FANOUT)
        } else {
            k
        };

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(fetch))
            .map_err(|e| RagError::Retrieval(format!("Search failed: {e}")))?;

        let mut hits = Vec::new();
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| RagError::Retrieval(format!("Failed to retrieve document: {e}")))?;

            let id = doc
                .get_first(self.f_chunk_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            if !self.matches_category(&id, category) {
                continue;
            }

            let doc_id = doc
                .get_first(self.f_doc_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let chunk_index = doc
                .get_first(self.f_chunk_index)
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;

            let text = doc
                .get_first(self.f_text)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let title = doc
                .get_first(self.f_title)
                .and_then(|v| v.as_str())
                .map(str::to_string);

            hits.push(SearchHit {
                id,
                doc_id,
                chunk_index,
                text,
                title,
                score,
            });

            if hits.len() >= k {
                break;
            }
        }

        Ok(hits)
    }

    fn remove_document(&self, doc_id: &str) -> Result<bool> {
        let mut writer = self.writer.lock();
        let existed = self.chunk_meta.read().values().any(|m| m.doc_id == doc_id);

        writer.delete_term(tantivy::Term::from_field_text(self.f_doc_id, doc_id));
        self.commit(&mut writer)?;
        self.chunk_meta.write().retain(|_, m| m.doc_id != doc_id);

        Ok(existed)
    }

    fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .delete_all_documents()
            .map_err(|e| RagError::Retrieval(format!("Failed to clear index: {e}")))?;
        self.commit(&mut writer)?;
        self.chunk_meta.write().clear();
        tracing::info!("Lexical index cleared");
        Ok(())
    }

    fn stats(&self) -> SparseStats {
        let meta = self.chunk_meta.read();
        let total_chunks = meta.len();
        let total_documents = meta
            .values()
            .map(|m| m.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let total_chars: usize = meta.values().map(|m| m.chars).sum();
        SparseStats {
            total_chunks,
            total_documents,
            average_chunk_chars: if total_chunks == 0 {
                0.0
            } else {
                total_chars as f64 / total_chunks as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, doc_id: &str, idx: usize, text: &str, cats: &[&str]) -> SparseDocument {
        SparseDocument {
            id: id.into(),
            doc_id: doc_id.into(),
            chunk_index: idx,
            text: text.into(),
            title: None,
            categories: cats.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn sample_index() -> Bm25Index {
        let index = Bm25Index::new().unwrap();
        index
            .index(&[
                doc("a", "rl", 0, "Rate limiting caps how many requests a client may send.", &["infra"]),
                doc("b", "rl", 1, "A token bucket refills tokens at a fixed rate.", &["infra"]),
                doc("c", "pto", 0, "Employees accrue paid leave every month.", &["hr"]),
                doc("d", "gw", 0, "The gateway applies rate limiting per API key.", &["infra", "api"]),
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_search_ranks_matching_chunks() {
        let index = sample_index();
        let hits = index.search("What is rate limiting?", 10, None).unwrap();
        assert!(!hits.is_empty());
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"d"));
        assert!(!ids.contains(&"c"));
        // Scores are descending
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_category_post_filter() {
        let index = sample_index();
        let hits = index.search("rate limiting", 10, Some("api")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "d");
        assert!(index.search("rate limiting", 10, Some("hr")).unwrap().is_empty());
    }

    #[test]
    fn test_stopword_only_query_returns_nothing() {
        let index = sample_index();
        assert!(index.search("what is the", 10, None).unwrap().is_empty());
        assert!(index.search("rate", 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_reindex_same_id_does_not_duplicate() {
        let index = sample_index();
        index
            .index(&[doc("a", "rl", 0, "Rate limiting caps how many requests a client may send.", &["infra"])])
            .unwrap();
        assert_eq!(index.stats().total_chunks, 4);
        let hits = index.search("requests client", 10, None).unwrap();
        assert_eq!(hits.iter().filter(|h| h.id == "a").count(), 1);
    }

    #[test]
    fn test_remove_document() {
        let index = sample_index();
        assert!(index.remove_document("rl").unwrap());
        assert!(!index.remove_document("rl").unwrap());
        let hits = index.search("token bucket rate", 10, None).unwrap();
        assert!(hits.iter().all(|h| h.doc_id != "rl"));
        assert_eq!(index.stats().total_documents, 2);
    }

    #[test]
    fn test_clear_and_stats() {
        let index = sample_index();
        let stats = index.stats();
        assert_eq!(stats.total_chunks, 4);
        assert_eq!(stats.total_documents, 3);
        assert!(stats.average_chunk_chars > 10.0);

        index.clear().unwrap();
        assert_eq!(index.stats(), SparseStats::default());
        assert!(index.search("rate limiting", 10, None).unwrap().is_empty());
    }

    #[test]
    fn test_hit_carries_stored_fields() {
        let index = Bm25Index::new().unwrap();
        let mut d = doc("x", "manual", 3, "Backoff with jitter avoids thundering herds.", &[]);
        d.title = Some("Ops manual".into());
        index.index(&[d]).unwrap();
        let hits = index.search("jitter", 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "manual");
        assert_eq!(hits[0].chunk_index, 3);
        assert_eq!(hits[0].title.as_deref(), Some("Ops manual"));
    }
}
