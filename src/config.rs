use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directory where the HTTP ingest endpoint stores uploaded bytes.
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
    /// Globs applied when ingesting a directory.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inbox_dir: default_inbox_dir(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_inbox_dir() -> PathBuf {
    PathBuf::from("./data/inbox")
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target token budget per chunk.
    pub target_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

fn default_overlap() -> usize {
    40
}

/// External reasoning capability used to propose semantic chunk boundaries.
#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_reasoning_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reasoning_key_env")]
    pub api_key_env: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            model: None,
            timeout_secs: default_reasoning_timeout(),
            max_retries: default_reasoning_retries(),
            api_key_env: default_reasoning_key_env(),
        }
    }
}

impl ReasoningConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_reasoning_timeout() -> u64 {
    60
}
fn default_reasoning_retries() -> u32 {
    2
}
fn default_reasoning_key_env() -> String {
    "REASONING_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout(),
            api_key_env: default_embed_key_env(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_embed_key_env() -> String {
    "EMBEDDING_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Worker count. Defaults to memory_budget_mb / worker_memory_mb,
    /// clamped to [1, 2 x cores]. The pool is sized against memory first.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_memory_budget")]
    pub memory_budget_mb: u64,
    #[serde(default = "default_worker_memory")]
    pub worker_memory_mb: u64,
    /// System memory percentage that triggers admission throttling.
    #[serde(default = "default_soft_pct")]
    pub memory_soft_pct: u64,
    /// System memory percentage that requeues the in-flight document.
    #[serde(default = "default_hard_pct")]
    pub memory_hard_pct: u64,
    /// Wall-clock budget per document before it is treated as stalled.
    #[serde(default = "default_document_timeout")]
    pub document_timeout_secs: u64,
    /// Attempts before a requeued document becomes terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: None,
            memory_budget_mb: default_memory_budget(),
            worker_memory_mb: default_worker_memory(),
            memory_soft_pct: default_soft_pct(),
            memory_hard_pct: default_hard_pct(),
            document_timeout_secs: default_document_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl OrchestratorConfig {
    pub fn effective_workers(&self) -> usize {
        if let Some(n) = self.workers {
            return n.max(1);
        }
        let by_memory = (self.memory_budget_mb / self.worker_memory_mb.max(1)) as usize;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        by_memory.clamp(1, cores * 2)
    }
}

fn default_memory_budget() -> u64 {
    4096
}
fn default_worker_memory() -> u64 {
    512
}
fn default_soft_pct() -> u64 {
    80
}
fn default_hard_pct() -> u64 {
    92
}
fn default_document_timeout() -> u64 {
    600
}
fn default_max_attempts() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
    /// Token budget for the assembled answer context.
    #[serde(default = "default_context_tokens")]
    pub context_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_threshold(),
            context_token_budget: default_context_tokens(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_threshold() -> f32 {
    0.6
}
fn default_context_tokens() -> usize {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7400".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than target_tokens");
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.base_url.is_none() {
            anyhow::bail!("embedding.base_url required when provider is enabled");
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be disabled or http.", other),
    }

    if config.reasoning.is_enabled() {
        if config.reasoning.base_url.is_none() {
            anyhow::bail!("reasoning.base_url required when provider is enabled");
        }
        if config.reasoning.model.is_none() {
            anyhow::bail!("reasoning.model required when provider is enabled");
        }
    }
    match config.reasoning.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!("Unknown reasoning provider: '{}'. Must be disabled or http.", other),
    }

    if config.orchestrator.memory_soft_pct >= config.orchestrator.memory_hard_pct {
        anyhow::bail!("orchestrator.memory_soft_pct must be below memory_hard_pct");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    Ok(())
}
