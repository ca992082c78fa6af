//! Bounded memo of answered questions.
//!
//! Only answers backed by good evidence are admitted; everything else is
//! recomputed on the next ask.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::config::{CacheConfig, EvictionPolicy};
use crate::models::{top_relevance, ConfidenceEvaluation, QueryResult};

/// Phrases that mark an answer as "the model found nothing".
const NO_INFORMATION_PATTERNS: &[&str] = &[
    "i don't know",
    "i do not know",
    "i don't have information",
    "no information",
    "not in the context",
    "context does not provide",
    "cannot find",
    "is not available",
    "there is no",
];

/// Why an answer was or wasn't stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Stored,
    NoSources,
    LowQuality,
    NoInformation,
    AtCapacity,
}

/// A stored answer with the evaluation it was produced under.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub result: QueryResult,
    pub evaluation: Option<ConfidenceEvaluation>,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, CachedAnswer>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct QueryCache {
    entries: RwLock<Entries>,
    config: CacheConfig,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            config,
        }
    }

    /// `lowercase(trim(question)) | topK | category`.
    pub fn key(question: &str, top_k: usize, category: Option<&str>) -> String {
        format!(
            "{}|{}|{}",
            question.trim().to_lowercase(),
            top_k,
            category.unwrap_or("")
        )
    }

    pub fn get(&self, key: &str) -> Option<CachedAnswer> {
        self.entries.read().map.get(key).cloned()
    }

    /// Store `result` under `key` if it passes the admission rules.
    pub fn admit(
        &self,
        key: &str,
        result: &QueryResult,
        evaluation: Option<&ConfidenceEvaluation>,
    ) -> Admission {
        if result.sources.is_empty() {
            return Admission::NoSources;
        }
        if top_relevance(&result.sources) < self.config.quality_threshold {
            return Admission::LowQuality;
        }
        if is_no_information_answer(&result.answer) {
            return Admission::NoInformation;
        }
        if self.config.capacity == 0 {
            return Admission::AtCapacity;
        }

        let answer = CachedAnswer {
            result: result.clone(),
            evaluation: evaluation.cloned(),
        };
        let mut entries = self.entries.write();
        if entries.map.contains_key(key) {
            entries.map.insert(key.to_string(), answer);
            return Admission::Stored;
        }
        if entries.map.len() >= self.config.capacity {
            match self.config.eviction {
                EvictionPolicy::Skip => return Admission::AtCapacity,
                EvictionPolicy::Oldest => {
                    if let Some(oldest) = entries.order.pop_front() {
                        entries.map.remove(&oldest);
                    }
                }
            }
        }
        entries.map.insert(key.to_string(), answer);
        entries.order.push_back(key.to_string());
        Admission::Stored
    }

    /// Drop every entry citing `doc_id`; returns how many went.
    pub fn invalidate_document(&self, doc_id: &str) -> usize {
        let mut entries = self.entries.write();
        let stale: Vec<String> = entries
            .map
            .iter()
            .filter(|(_, a)| a.result.sources.iter().any(|s| s.doc_id == doc_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.map.remove(key);
        }
        entries.order.retain(|k| !stale.contains(k));
        stale.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let dropped = entries.map.len();
        entries.map.clear();
        entries.order.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }
}

pub fn is_no_information_answer(answer: &str) -> bool {
    let lower = answer.trim().to_lowercase();
    let bare = lower.strip_suffix('.').unwrap_or(lower.as_str());
    if bare.is_empty() || bare == "unknown" || bare == "not found" {
        return true;
    }
    NO_INFORMATION_PATTERNS.iter().any(|p| lower.contains(p))
}
