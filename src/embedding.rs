//! Embedding backends and vector utilities.
//!
//! Defines the [`Embedder`] trait and two implementations:
//! - **[`HashEmbedder`]**: offline, deterministic feature hashing of word
//!   unigrams and character trigrams. The default backend.
//! - **[`HttpEmbedder`]**: calls an OpenAI-compatible `POST /embeddings`
//!   endpoint with batching, retry and backoff.
//!
//! Every embedder declares a fixed dimension. [`embed_texts`] checks each
//! returned vector against it and fails with
//! [`ProviderError::DimensionMismatch`] rather than letting a wrong-sized
//! vector reach the index.
//!
//! # Retry Strategy
//!
//! The HTTP embedder uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, EmbeddingBackend};
use crate::error::{Error, ProviderError, Result};
use crate::provider::openai::{status_error, transport_error};

/// Turns text into fixed-dimension dense vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, for logs and stats.
    fn model_name(&self) -> &str;
    /// Vector dimensionality; constant for the lifetime of the embedder.
    fn dims(&self) -> usize;
    /// Embed one batch. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

/// Embed `texts` in batches of `batch_size`, checking every dimension.
pub async fn embed_texts(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed_batch(batch).await?;
        if vectors.len() != batch.len() {
            return Err(Error::invalid(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for v in &vectors {
            if v.len() != embedder.dims() {
                return Err(ProviderError::DimensionMismatch {
                    expected: embedder.dims(),
                    actual: v.len(),
                }
                .into());
            }
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(embedder, &[text.to_string()], 1).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| Error::invalid("empty embedding response"))
}

// ============ Hash Embedder ============

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric word contributes a unigram feature (weight
/// 1.0) and its `#`-padded character trigrams (weight 0.5), hashed into
/// `dims` buckets with a hash-derived sign. The result is L2-normalised;
/// text without any word yields the zero vector.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in words(text) {
            self.add_feature(&mut v, &format!("w:{}", word), 1.0);
            let padded: Vec<char> = format!("#{}#", word).chars().collect();
            for tri in padded.windows(3) {
                let tri: String = tri.iter().collect();
                self.add_feature(&mut v, &format!("t:{}", tri), 0.5);
            }
        }
        normalize(&mut v);
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let bucket = (h % self.dims as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercase alphanumeric words of `text`.
pub(crate) fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ HTTP Embedder ============

/// Embedder backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    provider: String,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    max_retries: u32,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(
        provider: &crate::config::ProviderConfig,
        dims: usize,
        max_retries: u32,
    ) -> Result<Self> {
        let model = provider.embedding_model.clone().ok_or_else(|| {
            Error::invalid(format!("provider '{}' has no embedding_model", provider.name))
        })?;
        let client = reqwest::Client::builder()
            .timeout(provider.timeout())
            .build()
            .map_err(|e| Error::invalid(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            provider: provider.name.clone(),
            endpoint: provider.endpoint.trim_end_matches('/').to_string(),
            api_key: provider.resolved_api_key(),
            model,
            dims,
            max_retries,
            timeout: provider.timeout(),
            client,
        })
    }

    async fn send_once(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            transport_error(&self.provider, e, self.timeout)
        })?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.provider, status, body_text));
        }
        let json: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Unavailable {
                    provider: self.provider.clone(),
                    message: format!("invalid embeddings response: {}", e),
                })?;
        parse_embeddings_response(&self.provider, &json)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.send_once(texts).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(provider = %self.provider, attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ProviderError::NoProviderAvailable))
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_embeddings_response(
    provider: &str,
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
    let invalid = |message: &str| ProviderError::Unavailable {
        provider: provider.to_string(),
        message: message.to_string(),
    };
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("invalid embeddings response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("invalid embeddings response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the embedder selected by `[embedding]`.
pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedding.backend {
        EmbeddingBackend::Hash => Ok(Arc::new(HashEmbedder::new(config.index.vector_dim))),
        EmbeddingBackend::Provider => {
            let provider = config.embedding_provider().ok_or_else(|| {
                Error::invalid("embedding.backend = \"provider\" but no provider is configured")
            })?;
            Ok(Arc::new(HttpEmbedder::new(
                provider,
                config.index.vector_dim,
                config.embedding.max_retries,
            )?))
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WrongDims;

    #[async_trait]
    impl Embedder for WrongDims {
        fn model_name(&self) -> &str {
            "wrong"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_embedder_fixed_dimension() {
        let e = HashEmbedder::new(64);
        let long = "long text ".repeat(500);
        for text in ["", "a", "Cats purr.", long.as_str()] {
            let v = embed_query(&e, text).await.unwrap();
            assert_eq!(v.len(), 64);
        }
    }

    #[test]
    fn test_hash_embedder_deterministic_and_normalised() {
        let e = HashEmbedder::new(128);
        let a = e.embed_one("The B-tree is a self-balancing search tree.");
        assert_eq!(a, e.embed_one("The B-tree is a self-balancing search tree."));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_hash_embedder_similarity_tracks_overlap() {
        let e = HashEmbedder::new(256);
        let q = e.embed_one("purring cat");
        let cats = e.embed_one("Cats purr.");
        let dogs = e.embed_one("Dogs bark.");
        assert!(cosine_similarity(&q, &cats) > cosine_similarity(&q, &dogs));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_provider_error() {
        let err = embed_texts(&WrongDims, &["x".to_string()], 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let e = HashEmbedder::new(32);
        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        let out = embed_texts(&e, &texts, 3).await.unwrap();
        for (t, v) in texts.iter().zip(&out) {
            assert_eq!(&e.embed_one(t), v);
        }
    }

    #[test]
    fn test_parse_embeddings_response_sorts_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let out = parse_embeddings_response("p", &json).unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(parse_embeddings_response("p", &serde_json::json!({})).is_err());
    }
}
