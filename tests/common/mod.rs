//! Shared fixtures: temp databases, scripted capability stubs, and a
//! deterministic bag-of-words embedder.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use accord_index::config::Config;
use accord_index::db;
use accord_index::embedding::{Embedder, EmbeddingError};
use accord_index::migrate;
use accord_index::monitor::{MemorySample, MemorySampler, MemoryThresholds, ResourceMonitor};
use accord_index::orchestrator::PipelineContext;
use accord_index::progress::NoProgress;
use accord_index::reasoning::{ChunkProposal, ChunkProposer, ReasoningError};

pub const STUB_MODEL: &str = "stub-embed-1";
pub const STUB_DIMS: usize = 256;

/// Three-article agreement used by most scenarios. Article 3 repeats the
/// overtime phrasing so the retrieval scenario has an unambiguous top hit.
pub const AGREEMENT: &str = "\
CAO Voorbeeld 2026\n\n\
Artikel 1 Werkingssfeer\n\
Deze collectieve arbeidsovereenkomst geldt voor alle werknemers in dienst van de werkgever. De overeenkomst is van toepassing op de gehele onderneming en op alle vestigingen.\n\n\
Artikel 2 Loon\n\
Het maandloon wordt uiterlijk op de laatste werkdag van de maand betaald. Het loon volgt de loontabel uit de bijlage bij deze overeenkomst.\n\n\
Artikel 3 Overwerk\n\
The overtime compensation rate is 150 percent. The overtime compensation rate applies after eight hours. Employers must pay the overtime compensation rate monthly.\n";

pub fn test_config(root: &Path) -> Config {
    let toml_str = format!(
        r#"
[db]
path = "{}/acx.sqlite"

[chunking]
target_tokens = 300
overlap_tokens = 40
"#,
        root.display()
    );
    toml::from_str(&toml_str).expect("test config parses")
}

pub async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().expect("tempdir");
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.expect("connect");
    migrate::run_migrations(&pool).await.expect("migrate");
    (tmp, config, pool)
}

pub fn write_agreement(dir: &Path, file_name: &str) -> std::path::PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, AGREEMENT).expect("write agreement");
    path
}

// ============ Scripted reasoning capability ============

/// Proposes each article as a single whole chunk.
pub struct WholeArticleProposer;

#[async_trait]
impl ChunkProposer for WholeArticleProposer {
    fn provider_name(&self) -> &str {
        "whole-article"
    }

    async fn propose(
        &self,
        article_text: &str,
        _target_tokens: usize,
    ) -> Result<Vec<ChunkProposal>, ReasoningError> {
        Ok(vec![ChunkProposal {
            text: article_text.trim().to_string(),
            reasoning: "article kept whole".to_string(),
        }])
    }
}

/// Always-unavailable capability: every article degrades to the fallback.
pub struct UnavailableProposer;

#[async_trait]
impl ChunkProposer for UnavailableProposer {
    fn provider_name(&self) -> &str {
        "unavailable"
    }

    async fn propose(
        &self,
        _article_text: &str,
        _target_tokens: usize,
    ) -> Result<Vec<ChunkProposal>, ReasoningError> {
        Err(ReasoningError::Api("service unavailable".to_string()))
    }
}

// ============ Deterministic embedder ============

/// Bag-of-words embedder: tokens hash into a fixed number of buckets,
/// term frequencies accumulate, the vector is L2-normalized. Entirely
/// deterministic, so similarity scores are stable across runs.
pub struct HashEmbedder;

fn bucket(token: &str) -> usize {
    let h = token
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    (h % STUB_DIMS as u64) as usize
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; STUB_DIMS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        vector[bucket(token)] += 1.0;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        STUB_MODEL
    }

    fn dims(&self) -> usize {
        STUB_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Embedder whose retries are always exhausted; chunks must be deferred.
pub struct ExhaustedEmbedder;

#[async_trait]
impl Embedder for ExhaustedEmbedder {
    fn model_name(&self) -> &str {
        STUB_MODEL
    }

    fn dims(&self) -> usize {
        STUB_DIMS
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Exhausted("rate limited".to_string()))
    }
}

/// Embedder reporting a different model id, for mismatch rejection tests.
pub struct OtherModelEmbedder;

#[async_trait]
impl Embedder for OtherModelEmbedder {
    fn model_name(&self) -> &str {
        "other-model-9"
    }

    fn dims(&self) -> usize {
        STUB_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

// ============ Scripted memory sampler ============

/// Replays a fixed sequence of used-memory values (total fixed at
/// 1000 MB), repeating the last one forever.
pub struct SequenceSampler {
    values: Vec<u64>,
    cursor: AtomicUsize,
}

impl SequenceSampler {
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl MemorySampler for SequenceSampler {
    fn sample(&self) -> MemorySample {
        let i = self.cursor.fetch_add(1, Ordering::SeqCst);
        let used = *self.values.get(i).or(self.values.last()).unwrap_or(&0);
        MemorySample {
            used_mb: used,
            total_mb: 1000,
        }
    }
}

pub fn quiet_monitor() -> Arc<ResourceMonitor> {
    Arc::new(ResourceMonitor::with_sampler(
        Box::new(SequenceSampler::new(vec![100])),
        MemoryThresholds {
            soft_pct: 80,
            hard_pct: 92,
        },
    ))
}

// ============ Pipeline context builder ============

pub fn context(
    pool: &SqlitePool,
    config: &Config,
    proposer: Arc<dyn ChunkProposer>,
    embedder: Option<Arc<dyn Embedder>>,
    monitor: Arc<ResourceMonitor>,
) -> Arc<PipelineContext> {
    Arc::new(PipelineContext {
        pool: pool.clone(),
        config: config.clone(),
        proposer,
        embedder,
        monitor,
        reporter: Arc::new(NoProgress),
    })
}

pub fn cancel_rx() -> tokio::sync::watch::Receiver<bool> {
    // The sender is dropped immediately; borrow() keeps returning the
    // initial `false`, which is all run_batch reads.
    let (_tx, rx) = tokio::sync::watch::channel(false);
    rx
}
