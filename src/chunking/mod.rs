//! Document chunking: size-bounded, overlapping passages cut at the most
//! natural boundary available.
//!
//! Every chunk after the first starts with the last `overlap_chars` chars of
//! the chunk before it followed by a newline, so the fresh text of a chunk is
//! packed into `max_chars - overlap_chars - 1` chars. Inside that window the
//! packer looks for the strongest break that still leaves at least
//! `min_chars` behind it.

pub mod units;

use crate::config::ChunkingConfig;
use crate::error::Result;
use units::{split_units, Unit};

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into chunks. Blank input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let budget = self.config.body_budget();
        let units = split_units(text, budget / 2);
        if units.is_empty() {
            return Vec::new();
        }

        let bodies = pack(&units, self.config.max_chars, budget, self.config.min_chars);
        with_overlap(bodies, self.config.overlap_chars)
    }
}

/// Greedily fill each window, then move the cut back to the strongest
/// boundary that keeps the chunk at or above `min_chars`.
fn pack(units: &[Unit], first_window: usize, window: usize, min_chars: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut start = 0usize;

    while start < units.len() {
        let limit = if bodies.is_empty() { first_window } else { window };

        // lens[k] = length of units[start..=start + k] joined
        let mut lens: Vec<usize> = Vec::new();
        let mut len = 0usize;
        let mut end = start;
        while end < units.len() {
            let add = if end == start {
                units[end].chars
            } else {
                units[end].sep_chars() + units[end].chars
            };
            if len + add > limit && end > start {
                break;
            }
            len += add;
            lens.push(len);
            end += 1;
        }

        if end == units.len() {
            bodies.push(join(&units[start..end]));
            break;
        }

        let mut cut = end;
        let mut cut_brk = units[end].brk;
        for c in (start + 1..end).rev() {
            if lens[c - start - 1] < min_chars {
                break;
            }
            if units[c].brk > cut_brk {
                cut = c;
                cut_brk = units[c].brk;
            }
        }

        bodies.push(join(&units[start..cut]));
        start = cut;
    }

    bodies
}

fn join(units: &[Unit]) -> String {
    let mut out = String::new();
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            out.push_str(unit.sep);
        }
        out.push_str(&unit.text);
    }
    out
}

fn with_overlap(bodies: Vec<String>, overlap_chars: usize) -> Vec<String> {
    if overlap_chars == 0 {
        return bodies;
    }

    let mut chunks: Vec<String> = Vec::with_capacity(bodies.len());
    for body in bodies {
        let chunk = match chunks.last() {
            Some(prev) => format!("{}\n{}", tail_chars(prev, overlap_chars), body),
            None => body,
        };
        chunks.push(chunk);
    }
    chunks
}

/// Last `n` chars of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    match s.char_indices().nth(total - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
