//! Embedding capability client, cache, and vector helpers.
//!
//! The [`Embedder`] trait hides the external embedding service. The HTTP
//! implementation batches texts per call and retries transient failures
//! (429/5xx/network) with exponential backoff: 1s, 2s, 4s, ... capped at
//! 32s. Other 4xx responses fail immediately.
//!
//! [`CachedEmbedder`] layers the (content hash, model) cache on top, so
//! re-chunking unchanged text never re-embeds it.
//!
//! Vector helpers encode embeddings as little-endian f32 BLOBs for SQLite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding api error: {0}")]
    Api(String),
    #[error("embedding response invalid: {0}")]
    InvalidResponse(String),
    #[error("embedding retries exhausted: {0}")]
    Exhausted(String),
}

/// Fixed-dimension embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stored alongside every vector (e.g. `"legal-embed-2"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// No-op provider used when embeddings are not configured.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

/// HTTP embedding provider (OpenAI-compatible `/embeddings` contract).
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.base_url required"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dims,
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = response
                            .json()
                            .await
                            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                        if parsed.data.len() != texts.len() {
                            return Err(EmbeddingError::InvalidResponse(format!(
                                "expected {} vectors, got {}",
                                texts.len(),
                                parsed.data.len()
                            )));
                        }
                        return Ok(parsed.data.into_iter().map(|d| d.embedding).collect());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("{}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EmbeddingError::Api(format!("{}: {}", status, body_text)));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EmbeddingError::Exhausted(
            last_err.unwrap_or_else(|| "no attempts made".to_string()),
        ))
    }
}

/// Embed a single query text. Convenience wrapper for search.
pub async fn embed_single(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbeddingError> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    vectors
        .pop()
        .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding response".to_string()))
}

/// Build the configured embedder, or `None` when disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpEmbedder::new(config)?))),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Cache-aware embedding front. Shared across workers; cache writes are
/// idempotent upserts keyed by (sha256(text), model).
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    pool: SqlitePool,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, pool: SqlitePool) -> Self {
        Self { inner, pool }
    }

    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    pub fn dims(&self) -> usize {
        self.inner.dims()
    }

    /// Embed a batch, serving cache hits locally and calling the service
    /// only for misses. Returns vectors in input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let model = self.inner.model_name().to_string();
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let hash = hash_text(text);
            let row = sqlx::query("SELECT embedding FROM embedding_cache WHERE content_hash = ? AND model = ?")
                .bind(&hash)
                .bind(&model)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EmbeddingError::Api(format!("cache read failed: {}", e)))?;

            match row {
                Some(row) => {
                    let blob: Vec<u8> = row.get("embedding");
                    results[i] = Some(blob_to_vec(&blob));
                }
                None => misses.push(i),
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed(&miss_texts).await?;

            let now = chrono::Utc::now().timestamp();
            for (&i, vector) in misses.iter().zip(vectors.iter()) {
                let hash = hash_text(&texts[i]);
                sqlx::query(
                    r#"
                    INSERT INTO embedding_cache (content_hash, model, dims, embedding, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(content_hash, model) DO UPDATE SET
                        dims = excluded.dims,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(&hash)
                .bind(&model)
                .bind(vector.len() as i64)
                .bind(vec_to_blob(vector))
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| EmbeddingError::Api(format!("cache write failed: {}", e)))?;

                results[i] = Some(vector.clone());
            }
        }

        Ok(results
            .into_iter()
            .map(|v| v.expect("every slot filled by cache or service"))
            .collect())
    }
}

/// sha256 hex digest of a chunk text, the cache key component.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
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

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// lengths.
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

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        assert_eq!(hash_text("abc"), hash_text("abc"));
        assert_ne!(hash_text("abc"), hash_text("abd"));
    }

    #[tokio::test]
    async fn disabled_embedder_errors() {
        let err = DisabledEmbedder.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Disabled));
    }
}
