//! Reciprocal Rank Fusion over the dense and lexical candidate lists.
//!
//! Each shard yields candidates ordered best-first. A chunk at 1-based rank
//! `r` in a list contributes `1 / (c + r)`; a chunk's fused score is the sum
//! over the lists it appears in. Ordering is fully deterministic:
//!
//! 1. fused score, descending
//! 2. dense score, descending (chunks absent from the dense list sort last)
//! 3. chunk id, ascending

use std::cmp::Ordering;
use std::collections::HashMap;

/// One entry of a shard's ranked list.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: String,
    pub score: f64,
}

impl Candidate {
    pub fn new(chunk_id: impl Into<String>, score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
        }
    }
}

/// A fused result, before chunk content is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub chunk_id: String,
    pub score: f64,
    pub dense_score: Option<f64>,
    pub lexical_score: Option<f64>,
}

/// Fuse two best-first lists and return the top `k`.
pub fn rrf_fuse(dense: &[Candidate], lexical: &[Candidate], c: f64, k: usize) -> Vec<Fused> {
    let mut fused: HashMap<&str, Fused> = HashMap::new();

    for (rank, cand) in dense.iter().enumerate() {
        let entry = fused.entry(cand.chunk_id.as_str()).or_insert_with(|| Fused {
            chunk_id: cand.chunk_id.clone(),
            score: 0.0,
            dense_score: None,
            lexical_score: None,
        });
        entry.score += 1.0 / (c + (rank + 1) as f64);
        entry.dense_score = Some(cand.score);
    }

    for (rank, cand) in lexical.iter().enumerate() {
        let entry = fused.entry(cand.chunk_id.as_str()).or_insert_with(|| Fused {
            chunk_id: cand.chunk_id.clone(),
            score: 0.0,
            dense_score: None,
            lexical_score: None,
        });
        entry.score += 1.0 / (c + (rank + 1) as f64);
        entry.lexical_score = Some(cand.score);
    }

    let mut results: Vec<Fused> = fused.into_values().collect();
    results.sort_by(compare_fused);
    results.truncate(k);
    results
}

fn compare_fused(a: &Fused, b: &Fused) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            let da = a.dense_score.unwrap_or(f64::NEG_INFINITY);
            let db = b.dense_score.unwrap_or(f64::NEG_INFINITY);
            db.partial_cmp(&da).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Sort a shard's candidates best-first (score desc, chunk id asc) and keep `k`.
pub fn rank_candidates(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(k);
    candidates
}

/// Build an FTS5 query that ORs every quoted query word.
///
/// Quoting keeps user punctuation (`B-tree`, `C++`, `AND`) from being read
/// as FTS5 syntax. Returns `None` when the query has no words.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = crate::embedding::words(text)
        .map(|w| format!("\"{}\"", w))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
