//! Core data models shared across the retrieval, tool and agent subsystems.
//!
//! These types are plain data: persistence lives in [`crate::store`],
//! [`crate::index`] and [`crate::memory`]; behaviour lives with the services
//! that own them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Metadata attached to documents, chunks and notes.
pub type Metadata = Map<String, Value>;

/// Normalized document stored in SQLite.
///
/// Immutable once written. Re-ingesting identical `source + content`
/// yields the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub content: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Build a document with its content-derived id.
    pub fn new(source: impl Into<String>, content: impl Into<String>, metadata: Metadata) -> Self {
        let source = source.into();
        let content = content.into();
        Self {
            id: document_id(&source, &content),
            source,
            content,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Build a document with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Stable document id: truncated SHA-256 of `source \0 content`.
pub fn document_id(source: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// Deterministic chunk id derived from its document and ordinal.
pub fn chunk_id(doc_id: &str, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", doc_id, ordinal).as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// A chunk of a document's content, the unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub content: String,
    /// Empty until the embedder fills it in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// A fused search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub ordinal: usize,
    pub content: String,
    pub metadata: Metadata,
    /// Reciprocal-rank-fusion score.
    pub score: f64,
    /// Cosine similarity against the query, `None` when absent from the dense list.
    pub dense_score: Option<f32>,
    /// Negated bm25 rank, `None` when absent from the lexical list.
    pub lexical_score: Option<f64>,
}

/// A tool advertised by a running tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Registry name: `<server>_<tool>`.
    pub fn qualified_name(&self) -> String {
        format!("{}_{}", self.server_name, self.tool_name)
    }
}

/// A model-emitted tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Outcome of executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    /// Success payload, or `{"error": message}` on failure.
    pub data: Value,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ToolResult {
    /// Text handed back to the model for this result.
    pub fn to_model_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Kind of a long-term memory note.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Fact,
    Skill,
    Pattern,
    Context,
    Preference,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Fact => "fact",
            NoteKind::Skill => "skill",
            NoteKind::Pattern => "pattern",
            NoteKind::Context => "context",
            NoteKind::Preference => "preference",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(NoteKind::Fact),
            "skill" => Some(NoteKind::Skill),
            "pattern" => Some(NoteKind::Pattern),
            "context" => Some(NoteKind::Context),
            "preference" => Some(NoteKind::Preference),
            _ => None,
        }
    }
}

/// A persisted long-term memory note.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryNote {
    pub id: String,
    pub session_id: Option<String>,
    pub kind: NoteKind,
    pub content: String,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub importance: f32,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_stable_and_source_sensitive() {
        let a = document_id("file://a.txt", "hello");
        assert_eq!(a, document_id("file://a.txt", "hello"));
        assert_eq!(a.len(), 32);
        assert_ne!(a, document_id("file://b.txt", "hello"));
        // The separator keeps ("ab", "c") and ("a", "bc") apart.
        assert_ne!(document_id("ab", "c"), document_id("a", "bc"));
    }

    #[test]
    fn test_chunk_ids_distinct_per_ordinal() {
        assert_ne!(chunk_id("d", 0), chunk_id("d", 1));
        assert_eq!(chunk_id("d", 3), chunk_id("d", 3));
    }

    #[test]
    fn test_qualified_tool_name() {
        let t = ToolDescriptor {
            server_name: "demo".into(),
            tool_name: "now".into(),
            description: String::new(),
            input_schema: Value::Null,
        };
        assert_eq!(t.qualified_name(), "demo_now");
    }

    #[test]
    fn test_note_kind_parse() {
        for kind in [
            NoteKind::Fact,
            NoteKind::Skill,
            NoteKind::Pattern,
            NoteKind::Context,
            NoteKind::Preference,
        ] {
            assert_eq!(NoteKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NoteKind::parse("opinion"), None);
    }
}
