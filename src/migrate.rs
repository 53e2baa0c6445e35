use sqlx::SqlitePool;

use crate::error::{IndexError, Result};

/// Create every table and index if missing. Idempotent.
///
/// Also pins the index vector dimension: the first run records `vector_dim`
/// in `index_meta`, later runs with a different dimension fail with
/// [`IndexError::DimensionMismatch`].
pub async fn run_migrations(pool: &SqlitePool, vector_dim: usize) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            content TEXT NOT NULL,
            vector BLOB NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(doc_id, ordinal),
            FOREIGN KEY (doc_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            session_id TEXT,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            vector BLOB NOT NULL,
            importance REAL NOT NULL DEFAULT 0.5,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunk_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunk_fts USING fts5(
                chunk_id UNINDEXED,
                doc_id UNINDEXED,
                content,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc_id ON chunks(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_created_at ON documents(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC)",
    )
    .execute(pool)
    .await?;

    pin_vector_dim(pool, vector_dim).await
}

async fn pin_vector_dim(pool: &SqlitePool, vector_dim: usize) -> Result<()> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'vector_dim'")
            .fetch_optional(pool)
            .await?;

    match stored {
        Some(value) => {
            let expected: usize = value
                .parse()
                .map_err(|_| IndexError::Corrupt(format!("bad vector_dim '{}'", value)))?;
            if expected != vector_dim {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector_dim,
                }
                .into());
            }
        }
        None => {
            sqlx::query("INSERT INTO index_meta (key, value) VALUES ('vector_dim', ?)")
                .bind(vector_dim.to_string())
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::error::Error;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool, 64).await.unwrap();
        run_migrations(&pool, 64).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for t in ["chunk_fts", "chunks", "documents", "index_meta", "memories"] {
            assert!(tables.iter().any(|n| n == t), "missing table {}", t);
        }
    }

    #[tokio::test]
    async fn test_dimension_pinned_at_creation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("t.sqlite")).await.unwrap();
        run_migrations(&pool, 64).await.unwrap();
        let err = run_migrations(&pool, 128).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Index(IndexError::DimensionMismatch {
                expected: 64,
                actual: 128
            })
        ));
    }
}
