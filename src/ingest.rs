//! Ingestion pipeline: document → chunker → embedder → index + store.
//!
//! A single document is ingested sequentially: chunks are produced in
//! ordinal order, embedded in batches, then written with the document row
//! in one transaction. Re-ingesting the same document replaces its chunk set
//! with an identical one.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use crate::chunk::{chunk_document, ChunkOptions};
use crate::connector_fs;
use crate::embedding;
use crate::error::{Error, Result};
use crate::models::{Document, Metadata};
use crate::store::DocumentStore;

pub struct Ingestor {
    store: Arc<DocumentStore>,
    opts: ChunkOptions,
    batch_size: usize,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub chunks: usize,
}

/// Outcome of [`Ingestor::ingest_path`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PathReport {
    pub documents: usize,
    pub chunks: usize,
    pub doc_ids: Vec<String>,
}

impl Ingestor {
    pub fn new(store: Arc<DocumentStore>, opts: ChunkOptions, batch_size: usize) -> Result<Self> {
        if opts.chunk_size == 0 || opts.overlap >= opts.chunk_size {
            return Err(Error::invalid(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                opts.overlap, opts.chunk_size
            )));
        }
        Ok(Self {
            store,
            opts,
            batch_size,
        })
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub async fn ingest(&self, doc: &Document) -> Result<IngestReport> {
        let mut chunks = chunk_document(doc, &self.opts);
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embedder = self.store.index().embedder();
        let vectors = embedding::embed_texts(embedder.as_ref(), &texts, self.batch_size).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.vector = vector;
        }

        self.store.put(doc, &chunks).await?;
        tracing::info!(doc_id = %doc.id, source = %doc.source, chunks = chunks.len(), "ingested");
        Ok(IngestReport {
            doc_id: doc.id.clone(),
            chunks: chunks.len(),
        })
    }

    /// Ingest raw text under a content-derived id.
    pub async fn ingest_text(
        &self,
        source: &str,
        content: &str,
        metadata: Metadata,
    ) -> Result<IngestReport> {
        self.ingest(&Document::new(source, content, metadata)).await
    }

    /// Ingest every matching file under `root` (or `root` itself if a file).
    ///
    /// Each file becomes a document with `source = file://<path>` and
    /// `path` metadata holding its root-relative path.
    pub async fn ingest_path(
        &self,
        root: &Path,
        include_globs: &[String],
        exclude_globs: &[String],
    ) -> Result<PathReport> {
        let items = connector_fs::scan_directory(root, include_globs, exclude_globs, false)?;
        let mut report = PathReport::default();

        for item in items {
            if item.content.trim().is_empty() {
                tracing::debug!(path = %item.relative, "skipping empty file");
                continue;
            }
            let mut metadata = Metadata::new();
            metadata.insert("path".into(), Value::from(item.relative.clone()));
            let doc = Document::new(item.source(), item.content, metadata);
            let r = self.ingest(&doc).await?;
            report.documents += 1;
            report.chunks += r.chunks;
            report.doc_ids.push(r.doc_id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMethod;
    use crate::index::tests::test_index;

    async fn ingestor() -> (tempfile::TempDir, Ingestor) {
        let (tmp, index) = test_index(64).await;
        let store = Arc::new(DocumentStore::new(Arc::new(index)));
        let opts = ChunkOptions {
            chunk_size: 120,
            overlap: 20,
            method: ChunkMethod::Sentence,
        };
        (tmp, Ingestor::new(store, opts, 8).unwrap())
    }

    #[tokio::test]
    async fn test_substring_query_finds_document() {
        let (_tmp, ing) = ingestor().await;
        let text = "Tokio is an asynchronous runtime for Rust. It provides a scheduler, \
                    timers and async I/O. SQLite is an embedded database engine.";
        let r = ing.ingest_text("mem://doc", text, Metadata::new()).await.unwrap();
        assert!(r.chunks >= 1);

        let hits = ing
            .store()
            .index()
            .search("embedded database", 5, None)
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.doc_id == r.doc_id));
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (_tmp, ing) = ingestor().await;
        let doc = Document::new("mem://x", "Alpha beta gamma. ".repeat(30), Metadata::new());
        let a = ing.ingest(&doc).await.unwrap();
        let before = ing.store().chunks(&doc.id).await.unwrap();
        let b = ing.ingest(&doc).await.unwrap();
        let after = ing.store().chunks(&doc.id).await.unwrap();

        assert_eq!(a.chunks, b.chunks);
        assert_eq!(before, after);
        assert_eq!(ing.store().count().await.unwrap(), 1);
        let (dense, lexical) = ing.store().index().shard_counts().await.unwrap();
        assert_eq!(dense, a.chunks as i64);
        assert_eq!(lexical, a.chunks as i64);
    }

    #[tokio::test]
    async fn test_ingest_path_walks_directory() {
        let (_tmp, ing) = ingestor().await;
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.md"), "Lighthouses guide ships.").unwrap();
        std::fs::write(dir.path().join("two.txt"), "Glaciers carve valleys.").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "   ").unwrap();

        let report = ing.ingest_path(dir.path(), &[], &[]).await.unwrap();
        assert_eq!(report.documents, 2);

        let hits = ing.store().index().search("glaciers", 1, None).await.unwrap();
        let doc = ing.store().get(&hits[0].doc_id).await.unwrap();
        assert_eq!(doc.metadata["path"], "two.txt");
        assert!(doc.source.starts_with("file://"));
    }

    #[tokio::test]
    async fn test_rejects_bad_overlap() {
        let (_tmp, index) = test_index(64).await;
        let store = Arc::new(DocumentStore::new(Arc::new(index)));
        let opts = ChunkOptions {
            chunk_size: 10,
            overlap: 10,
            method: ChunkMethod::Token,
        };
        assert!(Ingestor::new(store, opts, 8).is_err());
    }
}
