//! Database statistics.
//!
//! A quick summary of what is indexed and remembered: document, chunk and
//! memory counts plus a per-source-scheme breakdown. Used by `ctxa stats`.

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    /// Source scheme (`file`, `stdin`, ...) or the whole source when it has none.
    pub scheme: String,
    pub documents: i64,
    pub chunks: i64,
    /// Newest document, milliseconds since the epoch.
    pub last_ingest_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: i64,
    pub chunks: i64,
    /// Rows in the lexical shard; equals `chunks` when both shards agree.
    pub lexical_rows: i64,
    pub memories: i64,
    pub vector_dim: Option<usize>,
    pub db_bytes: u64,
    pub by_source: Vec<SourceStats>,
}

pub async fn collect(pool: &SqlitePool, db_path: &Path) -> Result<IndexStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let lexical_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_fts")
        .fetch_one(pool)
        .await?;
    let memories: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memories")
        .fetch_one(pool)
        .await?;
    let vector_dim: Option<String> =
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'vector_dim'")
            .fetch_optional(pool)
            .await?;

    let rows = sqlx::query(
        r#"
        SELECT
            CASE WHEN instr(d.source, '://') > 0
                 THEN substr(d.source, 1, instr(d.source, '://') - 1)
                 ELSE d.source END AS scheme,
            COUNT(DISTINCT d.id) AS doc_count,
            COUNT(c.id) AS chunk_count,
            MAX(d.created_at) AS last_ingest
        FROM documents d
        LEFT JOIN chunks c ON c.doc_id = d.id
        GROUP BY scheme
        ORDER BY doc_count DESC, scheme ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_source = rows
        .iter()
        .map(|row| SourceStats {
            scheme: row.get("scheme"),
            documents: row.get("doc_count"),
            chunks: row.get("chunk_count"),
            last_ingest_ms: row.get("last_ingest"),
        })
        .collect();

    Ok(IndexStats {
        documents,
        chunks,
        lexical_rows,
        memories,
        vector_dim: vector_dim.and_then(|v| v.parse().ok()),
        db_bytes: std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0),
        by_source,
    })
}

/// Human-readable rendering for the CLI.
pub fn render(stats: &IndexStats, db_path: &Path) -> String {
    let mut out = String::new();
    out.push_str("Context Agent — Database Stats\n");
    out.push_str("==============================\n\n");
    out.push_str(&format!("  Database:    {}\n", db_path.display()));
    out.push_str(&format!("  Size:        {}\n", format_bytes(stats.db_bytes)));
    if let Some(dim) = stats.vector_dim {
        out.push_str(&format!("  Vector dim:  {}\n", dim));
    }
    out.push('\n');
    out.push_str(&format!("  Documents:   {}\n", stats.documents));
    out.push_str(&format!("  Chunks:      {}\n", stats.chunks));
    if stats.lexical_rows != stats.chunks {
        out.push_str(&format!(
            "  WARNING: lexical shard holds {} rows for {} chunks\n",
            stats.lexical_rows, stats.chunks
        ));
    }
    out.push_str(&format!("  Memories:    {}\n", stats.memories));

    if !stats.by_source.is_empty() {
        out.push_str("\n  By source:\n");
        out.push_str(&format!(
            "  {:<16} {:>6} {:>8}   {}\n",
            "SCHEME", "DOCS", "CHUNKS", "LAST INGEST"
        ));
        out.push_str(&format!("  {}\n", "-".repeat(52)));
        for s in &stats.by_source {
            let last = match s.last_ingest_ms {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            out.push_str(&format!(
                "  {:<16} {:>6} {:>8}   {}\n",
                s.scheme, s.documents, s.chunks, last
            ));
        }
    }
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp (seconds) relative to now, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
