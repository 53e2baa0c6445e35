//! Boundary-aware text chunker.
//!
//! Splits document content into overlapping [`Chunk`]s of at most
//! `chunk_size` **characters** (Unicode scalar values). Sizes, overlaps and
//! the `start_offset` / `end_offset` metadata are all measured in characters.
//!
//! Within each window the chunker looks for the last good boundary, in an
//! order that depends on the [`ChunkMethod`]:
//!
//! | Method | Boundary preference |
//! |--------|---------------------|
//! | `sentence` | sentence end, paragraph break, hard cut |
//! | `paragraph` | paragraph break, sentence end, hard cut |
//! | `token` | whitespace, hard cut |
//!
//! Consecutive chunks share up to `overlap` characters. Chunks are trimmed
//! of surrounding whitespace after the overlap is taken, so a cut next to
//! whitespace leaves a shorter shared region.
//!
//! A trailing chunk shorter than `chunk_size / 4` is folded into its
//! predecessor. Chunk ids are derived from `(doc_id, ordinal)`, so chunking
//! the same document twice yields identical chunks.

use serde::Deserialize;
use serde_json::Value;

use crate::models::{chunk_id, Chunk, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMethod {
    #[default]
    Sentence,
    Paragraph,
    Token,
}

impl std::str::FromStr for ChunkMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sentence" => Ok(ChunkMethod::Sentence),
            "paragraph" => Ok(ChunkMethod::Paragraph),
            "token" => Ok(ChunkMethod::Token),
            other => Err(format!(
                "unknown chunking method '{}': expected sentence, paragraph or token",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub overlap: usize,
    pub method: ChunkMethod,
}

impl From<&crate::config::ChunkingConfig> for ChunkOptions {
    fn from(c: &crate::config::ChunkingConfig) -> Self {
        Self {
            chunk_size: c.chunk_size,
            overlap: c.overlap,
            method: c.method,
        }
    }
}

/// Character range `[start, end)` of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Clone, Copy)]
enum Boundary {
    Sentence,
    Paragraph,
    Whitespace,
}

impl ChunkMethod {
    fn preference(&self) -> &'static [Boundary] {
        match self {
            ChunkMethod::Sentence => &[Boundary::Sentence, Boundary::Paragraph],
            ChunkMethod::Paragraph => &[Boundary::Paragraph, Boundary::Sentence],
            ChunkMethod::Token => &[Boundary::Whitespace],
        }
    }
}

/// Split a document into chunks, copying its metadata onto each one.
///
/// Vectors are left empty for the embedder to fill.
pub fn chunk_document(doc: &Document, opts: &ChunkOptions) -> Vec<Chunk> {
    let chars: Vec<char> = doc.content.chars().collect();
    split_text(&doc.content, opts)
        .into_iter()
        .enumerate()
        .map(|(ordinal, span)| {
            let mut metadata = doc.metadata.clone();
            metadata.insert("ordinal".into(), Value::from(ordinal));
            metadata.insert("start_offset".into(), Value::from(span.start));
            metadata.insert("end_offset".into(), Value::from(span.end));
            Chunk {
                id: chunk_id(&doc.id, ordinal),
                doc_id: doc.id.clone(),
                ordinal,
                content: chars[span.start..span.end].iter().collect(),
                vector: Vec::new(),
                metadata,
            }
        })
        .collect()
}

/// Compute chunk spans over `text`. Empty or all-whitespace text yields none.
///
/// Spans never begin or end on whitespace; the overlap between neighbours
/// is at most `opts.overlap` characters after that trimming.
pub fn split_text(text: &str, opts: &ChunkOptions) -> Vec<Span> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let size = opts.chunk_size.max(1);
    let overlap = opts.overlap.min(size - 1);

    let mut spans: Vec<Span> = Vec::new();
    let mut start = 0usize;

    while start < n {
        let end = if n - start <= size {
            n
        } else {
            // Boundaries must leave room for progress past the overlap, and
            // are not taken in the first half of the window.
            let lo = start + (overlap + 1).max(size / 2);
            let hi = start + size;
            opts.method
                .preference()
                .iter()
                .find_map(|b| last_boundary(&chars, lo, hi, *b))
                .unwrap_or(hi)
        };

        if let Some(span) = trim(&chars, Span { start, end }) {
            spans.push(span);
        }
        if end >= n {
            break;
        }
        start = end - overlap;
    }

    if spans.len() >= 2 {
        let last = spans[spans.len() - 1];
        if last.len() < size / 4 {
            spans.pop();
            if let Some(prev) = spans.last_mut() {
                prev.end = last.end;
            }
        }
    }

    spans
}

/// The largest `p` in `[lo, hi]` such that a chunk may end at `p`.
fn last_boundary(chars: &[char], lo: usize, hi: usize, kind: Boundary) -> Option<usize> {
    let hi = hi.min(chars.len());
    (lo.max(1)..=hi).rev().find(|&p| match kind {
        Boundary::Sentence => {
            matches!(chars[p - 1], '.' | '!' | '?')
                && (p == chars.len() || chars[p].is_whitespace())
        }
        Boundary::Paragraph => p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n',
        Boundary::Whitespace => p < chars.len() && chars[p].is_whitespace(),
    })
}

fn trim(chars: &[char], span: Span) -> Option<Span> {
    let mut start = span.start;
    let mut end = span.end;
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some(Span { start, end })
}
