//! Document store: documents keyed by id, persisted in SQLite.
//!
//! Writes go through the [`HybridIndex`] so a document row and its chunks in
//! both shards change in one transaction. [`DocumentStore::delete`] cascades
//! into the index.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::{parse_metadata, FilterClause, HybridIndex};
use crate::models::{Chunk, Document, Metadata};

pub struct DocumentStore {
    index: Arc<HybridIndex>,
}

/// One page of [`DocumentStore::list`].
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<Document>,
    /// Total documents matching the filter, across all pages.
    pub total: i64,
    pub offset: usize,
    pub limit: usize,
}

impl DocumentStore {
    pub fn new(index: Arc<HybridIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Arc<HybridIndex> {
        &self.index
    }

    /// Create or replace a document together with its embedded chunks.
    pub async fn put(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.doc_id != doc.id) {
            return Err(Error::invalid(format!(
                "chunk {} belongs to {}, not {}",
                stray.id, stray.doc_id, doc.id
            )));
        }
        self.index.write_document(doc, chunks).await
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let row = sqlx::query(
            "SELECT id, source, content, metadata_json, created_at FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.index.pool())
        .await?;

        match row {
            Some(row) => row_to_document(&row),
            None => Err(Error::NotFound(format!("document {}", id))),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(id)
            .fetch_one(self.index.pool())
            .await?;
        Ok(exists)
    }

    /// Chunks of a document in ordinal order. Vectors are not loaded.
    pub async fn chunks(&self, id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, doc_id, ordinal, content, metadata_json FROM chunks \
             WHERE doc_id = ? ORDER BY ordinal ASC",
        )
        .bind(id)
        .fetch_all(self.index.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Chunk {
                    id: row.get("id"),
                    doc_id: row.get("doc_id"),
                    ordinal: row.get::<i64, _>("ordinal") as usize,
                    content: row.get("content"),
                    vector: Vec::new(),
                    metadata: parse_metadata(&row.get::<String, _>("metadata_json"))?,
                })
            })
            .collect()
    }

    /// Documents matching every `filter` key, newest first.
    ///
    /// Ordering is `created_at DESC, id ASC`, stable across pages.
    pub async fn list(&self, filter: Option<&Metadata>, offset: usize, limit: usize) -> Result<Page> {
        let clause = FilterClause::build_for("documents.metadata_json", filter)?;

        let count_sql = format!("SELECT COUNT(*) FROM documents WHERE 1 = 1{}", clause.sql);
        let total_row = clause
            .bind_all(sqlx::query(&count_sql))
            .fetch_one(self.index.pool())
            .await?;
        let total: i64 = total_row.get(0);

        let sql = format!(
            "SELECT id, source, content, metadata_json, created_at FROM documents \
             WHERE 1 = 1{} ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
            clause.sql
        );
        let rows = clause
            .bind_all(sqlx::query(&sql))
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(self.index.pool())
            .await?;

        let items = rows.iter().map(row_to_document).collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            offset,
            limit,
        })
    }

    /// Delete a document and all its chunks. Returns the chunk count removed.
    pub async fn delete(&self, id: &str) -> Result<u64> {
        match self.index.delete_document(id).await? {
            Some(count) => {
                tracing::info!(doc_id = id, chunks = count, "document deleted");
                Ok(count)
            }
            None => Err(Error::NotFound(format!("document {}", id))),
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(self.index.pool())
            .await?;
        Ok(n)
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let created_ms: i64 = row.get("created_at");
    Ok(Document {
        id: row.get("id"),
        source: row.get("source"),
        content: row.get("content"),
        metadata: parse_metadata(&row.get::<String, _>("metadata_json"))?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_ms).unwrap_or_default(),
    })
}
