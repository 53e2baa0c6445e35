//! Long-term memory: short distilled notes with vectors, kept in the
//! `memories` table of the main database.
//!
//! Retrieval is brute-force cosine over every note, filtered by a minimum
//! score. Returned notes get `access_count` and `last_accessed` bumped;
//! `importance` and recency of use decide what is evicted once `max_notes`
//! is exceeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::agent::plan::extract_json_object;
use crate::config::MemoryConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, Embedder};
use crate::error::{Error, IndexError, Result};
use crate::index::parse_metadata;
use crate::models::{MemoryNote, Metadata, NoteKind};
use crate::orchestrator::Orchestrator;
use crate::provider::{system_message, user_message, GenerateOptions};
use crate::scope::Scope;

const NOTE_COLUMNS: &str = "id, session_id, kind, content, vector, importance, access_count, \
                            last_accessed, metadata_json, created_at, updated_at";

/// Input to [`MemoryStore::add`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewNote {
    pub kind: NoteKind,
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_importance() -> f32 {
    0.5
}

impl NewNote {
    pub fn new(kind: NoteKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            importance: default_importance(),
            metadata: Metadata::new(),
            session_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredNote {
    #[serde(flatten)]
    pub note: MemoryNote,
    pub score: f32,
}

pub struct MemoryStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    min_score: f32,
    max_notes: usize,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, config: &MemoryConfig) -> Self {
        Self {
            pool,
            embedder,
            min_score: config.min_score,
            max_notes: config.max_notes,
            writer: Mutex::new(()),
        }
    }

    /// Embed and store a note, then evict down to `max_notes`.
    pub async fn add(&self, note: NewNote) -> Result<MemoryNote> {
        let content = note.content.trim();
        if content.is_empty() {
            return Err(Error::invalid("memory note content is empty"));
        }
        let vector = embed_query(self.embedder.as_ref(), content).await?;
        let now = Utc::now();
        let stored = MemoryNote {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: note.session_id,
            kind: note.kind,
            content: content.to_string(),
            vector,
            importance: note.importance.clamp(0.0, 1.0),
            access_count: 0,
            last_accessed: None,
            metadata: note.metadata,
            created_at: now,
            updated_at: now,
        };
        let metadata_json = serde_json::to_string(&stored.metadata)
            .map_err(|e| Error::invalid(format!("unserializable metadata: {}", e)))?;

        let _guard = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO memories (id, session_id, kind, content, vector, importance, \
             access_count, last_accessed, metadata_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(&stored.session_id)
        .bind(stored.kind.as_str())
        .bind(&stored.content)
        .bind(vec_to_blob(&stored.vector))
        .bind(stored.importance as f64)
        .bind(&metadata_json)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        tracing::debug!(note = %stored.id, kind = stored.kind.as_str(), "memory note stored");

        self.evict(&stored.id).await?;
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Result<MemoryNote> {
        let sql = format!("SELECT {} FROM memories WHERE id = ?", NOTE_COLUMNS);
        match sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await? {
            Some(row) => row_to_note(&row),
            None => Err(Error::NotFound(format!("memory note {}", id))),
        }
    }

    /// Notes by descending importance, optionally of one kind.
    pub async fn list(&self, kind: Option<NoteKind>, limit: usize) -> Result<Vec<MemoryNote>> {
        let rows = match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {} FROM memories WHERE kind = ? \
                     ORDER BY importance DESC, created_at DESC, id ASC LIMIT ?",
                    NOTE_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(kind.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM memories ORDER BY importance DESC, created_at DESC, id ASC LIMIT ?",
                    NOTE_COLUMNS
                );
                sqlx::query(&sql).bind(limit as i64).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(row_to_note).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        let res = sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("memory note {}", id)));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memories")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Top `k` notes with cosine similarity to `query` of at least the
    /// configured minimum. Bumps their access statistics.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredNote>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder.as_ref(), query).await?;
        let sql = format!("SELECT {} FROM memories", NOTE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut scored = Vec::new();
        for row in &rows {
            let note = row_to_note(row)?;
            let score = cosine_similarity(&query_vec, &note.vector);
            if score >= self.min_score {
                scored.push(ScoredNote { note, score });
            }
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.note.id.cmp(&b.note.id))
        });
        scored.truncate(k);
        if scored.is_empty() {
            return Ok(scored);
        }

        let now = Utc::now();
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        for hit in &mut scored {
            sqlx::query(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ? WHERE id = ?",
            )
            .bind(now.timestamp_millis())
            .bind(&hit.note.id)
            .execute(&mut *tx)
            .await?;
            hit.note.access_count += 1;
            hit.note.last_accessed = Some(now);
        }
        tx.commit().await?;
        Ok(scored)
    }

    /// Ask the model whether anything from a finished task is worth
    /// remembering and store what it proposes. Never fails: problems are
    /// logged and the number of stored notes is returned.
    pub async fn reflect(
        &self,
        orchestrator: &Orchestrator,
        scope: &Scope,
        goal: &str,
        outcome: &str,
        execution_log: &str,
    ) -> usize {
        let notes = match self.propose(orchestrator, scope, goal, outcome, execution_log).await {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!(error = %e, "reflection failed");
                return 0;
            }
        };
        let mut stored = 0;
        for note in notes {
            match self.add(note).await {
                Ok(_) => stored += 1,
                Err(e) => tracing::warn!(error = %e, "reflection note not stored"),
            }
        }
        if stored > 0 {
            tracing::info!(stored, "reflection stored memory notes");
        }
        stored
    }

    async fn propose(
        &self,
        orchestrator: &Orchestrator,
        scope: &Scope,
        goal: &str,
        outcome: &str,
        execution_log: &str,
    ) -> Result<Vec<NewNote>> {
        let messages = vec![
            system_message(REFLECT_PROMPT),
            user_message(&format!(
                "Goal: {}\n\nOutcome:\n{}\n\nExecution log:\n{}",
                goal, outcome, execution_log
            )),
        ];
        let options = GenerateOptions {
            temperature: Some(0.0),
            ..GenerateOptions::default()
        };
        let completion = orchestrator.generate(scope, &messages, &options).await?;
        parse_reflection(&completion.content)
    }

    /// Delete the lowest-importance, least recently used notes above
    /// `max_notes`. A note never accessed counts as used when created;
    /// `keep` is never a candidate.
    async fn evict(&self, keep: &str) -> Result<u64> {
        let total = self.count().await?;
        let excess = total - self.max_notes as i64;
        if excess <= 0 {
            return Ok(0);
        }
        let res = sqlx::query(
            "DELETE FROM memories WHERE id IN (SELECT id FROM memories WHERE id != ? \
             ORDER BY importance ASC, COALESCE(last_accessed, created_at) ASC, created_at ASC LIMIT ?)",
        )
        .bind(keep)
        .bind(excess)
        .execute(&self.pool)
        .await?;
        tracing::info!(evicted = res.rows_affected(), "memory notes evicted");
        Ok(res.rows_affected())
    }
}

const REFLECT_PROMPT: &str = r#"You maintain a long-term memory of short, reusable notes.
Given a finished task, decide whether anything is worth remembering for future tasks:
stable facts, working procedures, recurring patterns, user preferences.
Reply with a single JSON object:
{"notes": [{"kind": "fact|skill|pattern|context|preference", "content": "...", "importance": 0.0}]}
Use an empty list when nothing is worth keeping. Importance is between 0 and 1."#;

#[derive(Deserialize)]
struct Reflection {
    #[serde(default)]
    notes: Vec<NewNote>,
}

fn parse_reflection(text: &str) -> Result<Vec<NewNote>> {
    let body = extract_json_object(text)
        .ok_or_else(|| Error::invalid("reflection output contains no JSON object"))?;
    let parsed: Reflection = serde_json::from_str(body)
        .map_err(|e| Error::invalid(format!("malformed reflection: {}", e)))?;
    Ok(parsed
        .notes
        .into_iter()
        .filter(|n| !n.content.trim().is_empty())
        .collect())
}

fn row_to_note(row: &SqliteRow) -> Result<MemoryNote> {
    let kind: String = row.get("kind");
    let kind = NoteKind::parse(&kind)
        .ok_or_else(|| IndexError::Corrupt(format!("unknown memory kind '{}'", kind)))?;
    let ts = |ms: i64| DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default();
    Ok(MemoryNote {
        id: row.get("id"),
        session_id: row.get("session_id"),
        kind,
        content: row.get("content"),
        vector: blob_to_vec(&row.get::<Vec<u8>, _>("vector")),
        importance: row.get::<f64, _>("importance") as f32,
        access_count: row.get("access_count"),
        last_accessed: row.get::<Option<i64>, _>("last_accessed").map(ts),
        metadata: parse_metadata(&row.get::<String, _>("metadata_json"))?,
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
    })
}
