//! Hybrid index: a dense shard and a lexical shard over the same chunk set.
//!
//! Both shards live in the same SQLite database:
//!
//! - **Dense shard**: the `vector` BLOB column of `chunks`, searched by
//!   brute-force cosine similarity in Rust.
//! - **Lexical shard**: the `chunk_fts` FTS5 table (porter stemming),
//!   ranked by `bm25()`.
//!
//! Every write touches both shards inside one SQLite transaction while
//! holding the index's cross-shard write lock, so a document's chunks are
//! either visible in both shards or in neither. Searches hold the read lock
//! across both shard queries.

use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::IndexConfig;
use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use crate::error::{Error, IndexError, Result};
use crate::models::{Chunk, Document, Metadata, SearchHit};
use crate::search::{fts_query, rank_candidates, rrf_fuse, Candidate};

pub struct HybridIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    dims: usize,
    rrf_constant: f64,
    candidate_k: usize,
    lock: RwLock<()>,
}

impl HybridIndex {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, config: &IndexConfig) -> Result<Self> {
        if embedder.dims() != config.vector_dim {
            return Err(IndexError::DimensionMismatch {
                expected: config.vector_dim,
                actual: embedder.dims(),
            }
            .into());
        }
        Ok(Self {
            pool,
            embedder,
            dims: config.vector_dim,
            rrf_constant: config.rrf_constant,
            candidate_k: config.candidate_k,
            lock: RwLock::new(()),
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace chunks in both shards in one transaction.
    ///
    /// A chunk replaces any existing chunk with the same id or the same
    /// `(doc_id, ordinal)`. The owning documents must already exist.
    pub async fn upsert(&self, chunks: &[Chunk]) -> Result<usize> {
        self.check_dims(chunks)?;
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "DELETE FROM chunk_fts WHERE chunk_id IN \
                 (SELECT id FROM chunks WHERE id = ? OR (doc_id = ? AND ordinal = ?))",
            )
            .bind(&chunk.id)
            .bind(&chunk.doc_id)
            .bind(chunk.ordinal as i64)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM chunks WHERE id = ? OR (doc_id = ? AND ordinal = ?)")
                .bind(&chunk.id)
                .bind(&chunk.doc_id)
                .bind(chunk.ordinal as i64)
                .execute(&mut *tx)
                .await?;
            insert_chunk(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(chunks.len())
    }

    /// Delete every chunk of `doc_id` from both shards. Returns the count.
    pub async fn delete_by_doc(&self, doc_id: &str) -> Result<u64> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        let deleted = delete_chunks(&mut tx, doc_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Write a document row and replace its full chunk set atomically.
    pub(crate) async fn write_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        self.check_dims(chunks)?;
        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| Error::invalid(format!("unserializable metadata: {}", e)))?;

        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source, content, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source = excluded.source,
                content = excluded.content,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source)
        .bind(&doc.content)
        .bind(&metadata_json)
        .bind(doc.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        delete_chunks(&mut tx, &doc.id).await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a document row and its chunks. `None` if it did not exist.
    pub(crate) async fn delete_document(&self, doc_id: &str) -> Result<Option<u64>> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Ok(None);
        }

        let deleted = delete_chunks(&mut tx, doc_id).await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(deleted))
    }

    /// Hybrid search fused with Reciprocal Rank Fusion.
    ///
    /// `filters` restrict both shards to chunks whose metadata equals every
    /// given key/value pair.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = embedding::embed_query(self.embedder.as_ref(), query).await?;
        let depth = self.candidate_k.max(k);

        let _guard = self.lock.read().await;
        let dense = self.dense_candidates(&query_vec, depth, filters).await?;
        let lexical = self.lexical_candidates(query, depth, filters).await?;

        let fused = rrf_fuse(&dense, &lexical, self.rrf_constant, k);
        tracing::debug!(
            dense = dense.len(),
            lexical = lexical.len(),
            returned = fused.len(),
            "hybrid search"
        );

        let mut hits = Vec::with_capacity(fused.len());
        for f in fused {
            let row = sqlx::query(
                "SELECT doc_id, ordinal, content, metadata_json FROM chunks WHERE id = ?",
            )
            .bind(&f.chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else { continue };
            hits.push(SearchHit {
                chunk_id: f.chunk_id,
                doc_id: row.get("doc_id"),
                ordinal: row.get::<i64, _>("ordinal") as usize,
                content: row.get("content"),
                metadata: parse_metadata(&row.get::<String, _>("metadata_json"))?,
                score: f.score,
                dense_score: f.dense_score.map(|s| s as f32),
                lexical_score: f.lexical_score,
            });
        }
        Ok(hits)
    }

    /// Dense shard: top `k` chunk ids by cosine similarity to `query_vec`.
    pub async fn top_k_cosine(&self, query_vec: &[f32], k: usize) -> Result<Vec<Candidate>> {
        let _guard = self.lock.read().await;
        self.dense_candidates(query_vec, k, None).await
    }

    /// Lexical shard: top `k` chunk ids by bm25 (score is the negated rank).
    pub async fn top_k_bm25(&self, query_text: &str, k: usize) -> Result<Vec<Candidate>> {
        let _guard = self.lock.read().await;
        self.lexical_candidates(query_text, k, None).await
    }

    async fn dense_candidates(
        &self,
        query_vec: &[f32],
        k: usize,
        filters: Option<&Metadata>,
    ) -> Result<Vec<Candidate>> {
        if query_vec.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query_vec.len(),
            }
            .into());
        }
        let filter = FilterClause::build(filters)?;
        let sql = format!("SELECT id, vector FROM chunks WHERE 1 = 1{}", filter.sql);
        let rows = filter.bind_all(sqlx::query(&sql)).fetch_all(&self.pool).await?;

        // Fetch all vectors and compute cosine similarity in Rust
        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let vec = blob_to_vec(&blob);
                Candidate::new(
                    row.get::<String, _>("id"),
                    cosine_similarity(query_vec, &vec) as f64,
                )
            })
            .collect();
        Ok(rank_candidates(candidates, k))
    }

    async fn lexical_candidates(
        &self,
        query_text: &str,
        k: usize,
        filters: Option<&Metadata>,
    ) -> Result<Vec<Candidate>> {
        let Some(fts) = fts_query(query_text) else {
            return Ok(Vec::new());
        };
        let filter = FilterClause::build(filters)?;
        let sql = format!(
            r#"
            SELECT chunk_fts.chunk_id AS chunk_id, bm25(chunk_fts) AS score
            FROM chunk_fts
            JOIN chunks ON chunks.id = chunk_fts.chunk_id
            WHERE chunk_fts MATCH ?{}
            ORDER BY score, chunk_id
            LIMIT ?
            "#,
            filter.sql
        );
        let query = filter.bind_all(sqlx::query(&sql).bind(fts));
        let rows = query.bind(k as i64).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("score");
                // negate so higher = better
                Candidate::new(row.get::<String, _>("chunk_id"), -rank)
            })
            .collect())
    }

    /// Number of chunks in the dense shard and in the lexical shard.
    pub async fn shard_counts(&self) -> Result<(i64, i64)> {
        let _guard = self.lock.read().await;
        let dense: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let lexical: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok((dense, lexical))
    }

    fn check_dims(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            if chunk.vector.len() != self.dims {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dims,
                    actual: chunk.vector.len(),
                }
                .into());
            }
        }
        Ok(())
    }
}

async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    let metadata_json = serde_json::to_string(&chunk.metadata)
        .map_err(|e| Error::invalid(format!("unserializable metadata: {}", e)))?;
    sqlx::query(
        "INSERT INTO chunks (id, doc_id, ordinal, content, vector, metadata_json) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&chunk.id)
    .bind(&chunk.doc_id)
    .bind(chunk.ordinal as i64)
    .bind(&chunk.content)
    .bind(vec_to_blob(&chunk.vector))
    .bind(&metadata_json)
    .execute(&mut **tx)
    .await?;

    sqlx::query("INSERT INTO chunk_fts (chunk_id, doc_id, content) VALUES (?, ?, ?)")
        .bind(&chunk.id)
        .bind(&chunk.doc_id)
        .bind(&chunk.content)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn delete_chunks(tx: &mut Transaction<'_, Sqlite>, doc_id: &str) -> Result<u64> {
    sqlx::query("DELETE FROM chunk_fts WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    let result = sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) fn parse_metadata(json: &str) -> Result<Metadata> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Metadata::new()),
        Err(e) => Err(IndexError::Corrupt(format!("metadata_json: {}", e)).into()),
    }
}

/// SQL fragment restricting `chunks.metadata_json` by key equality.
pub(crate) struct FilterClause {
    pub(crate) sql: String,
    binds: Vec<(String, Option<FilterValue>)>,
}

enum FilterValue {
    Text(String),
    Int(i64),
    Real(f64),
}

impl FilterClause {
    pub(crate) fn build(filters: Option<&Metadata>) -> Result<Self> {
        Self::build_for("chunks.metadata_json", filters)
    }

    pub(crate) fn build_for(column: &str, filters: Option<&Metadata>) -> Result<Self> {
        let mut sql = String::new();
        let mut binds = Vec::new();
        for (key, value) in filters.into_iter().flatten() {
            if key.contains('"') {
                return Err(Error::invalid(format!("invalid filter key: {}", key)));
            }
            let path = format!("$.\"{}\"", key);
            let value = match value {
                Value::Null => None,
                Value::Bool(b) => Some(FilterValue::Int(*b as i64)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Some(FilterValue::Int(i)),
                    None => Some(FilterValue::Real(n.as_f64().unwrap_or(0.0))),
                },
                Value::String(s) => Some(FilterValue::Text(s.clone())),
                other => Some(FilterValue::Text(other.to_string())),
            };
            match value {
                None => sql.push_str(&format!(" AND json_extract({}, ?) IS NULL", column)),
                Some(_) => sql.push_str(&format!(" AND json_extract({}, ?) = ?", column)),
            }
            binds.push((path, value));
        }
        Ok(Self { sql, binds })
    }

    pub(crate) fn bind_all<'q>(
        &'q self,
        mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for (path, value) in &self.binds {
            query = query.bind(path.as_str());
            query = match value {
                None => query,
                Some(FilterValue::Text(s)) => query.bind(s.as_str()),
                Some(FilterValue::Int(i)) => query.bind(*i),
                Some(FilterValue::Real(f)) => query.bind(*f),
            };
        }
        query
    }
}
