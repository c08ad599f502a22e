//! Core data models for the ingestion and retrieval pipeline.
//!
//! The relational rows (documents, articles, chunks, references,
//! checkpoints) are the authoritative representation; everything in the
//! derived graph/vector index is rebuilt from these.

/// Processing state of a registered document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Parsed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Parsed => "parsed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "parsed" => Some(DocumentStatus::Parsed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted per-document processing state, stored independently of the
/// document row so a crash mid-write is detectable on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl CheckpointState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointState::Pending => "pending",
            CheckpointState::InProgress => "in_progress",
            CheckpointState::Done => "done",
            CheckpointState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CheckpointState::Pending),
            "in_progress" => Some(CheckpointState::InProgress),
            "done" => Some(CheckpointState::Done),
            "failed" => Some(CheckpointState::Failed),
            _ => None,
        }
    }
}

/// A registered agreement document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub source: String,
    pub mime: String,
    pub source_path: String,
    pub status: DocumentStatus,
    /// At least one article was chunked via the fallback splitter.
    pub degraded: bool,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Outcome of chunking one article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleStatus {
    Parsed,
    /// The article text was empty; zero chunks, still a terminal state.
    Empty,
    Failed,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Parsed => "parsed",
            ArticleStatus::Empty => "empty",
            ArticleStatus::Failed => "failed",
        }
    }
}

/// One article extracted from a document.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: String,
    pub document_id: String,
    pub article_number: String,
    pub title: Option<String>,
    pub full_text: String,
    pub status: ArticleStatus,
    pub error: Option<String>,
}

/// A bounded span of an article's text: the atomic unit of embedding
/// and retrieval. `(article_id, chunk_index)` is unique and chunk_index
/// values are contiguous from 0 once the article is parsed.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub article_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub start_offset: i64,
    pub end_offset: i64,
    pub reasoning: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    /// Embedding attempts were exhausted; stored without a vector and
    /// excluded from search until a backfill pass supplies one.
    pub deferred: bool,
}

/// Advisory cross-reference from one article to another article number.
/// Never required for retrieval correctness.
#[derive(Debug, Clone)]
pub struct ArticleRef {
    pub document_id: String,
    pub source_article_id: String,
    pub target_article_number: String,
    pub ref_type: String,
    pub confidence: f64,
}

/// A ranked retrieval result with full provenance.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub article_number: String,
    pub chunk_index: i64,
    pub score: f32,
    pub text: String,
}
