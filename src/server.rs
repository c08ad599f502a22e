//! HTTP JSON API over the pipeline's external interfaces.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Register raw document content, returns a pending id |
//! | `GET`  | `/documents/{id}` | Status with article/chunk/embedding counts |
//! | `POST` | `/search` | Tenant-scoped similarity search |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Processing stays batch-driven (`acx process`); this server only
//! registers, reports, and queries. All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::extract;
use crate::search::{run_query, SearchRequest};
use crate::status;
use crate::store;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    /// Long-lived embedding handle, shared across requests.
    embedder: Option<Arc<dyn Embedder>>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config, pool: SqlitePool) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let embedder = embedding::create_embedder(&config.embedding)?;

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        embedder,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_ingest))
        .route("/documents/{id}", get(handle_status))
        .route("/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind = %bind_addr, "API server listening");
    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

// ============ GET /health ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct IngestRequest {
    name: String,
    source: String,
    mime: String,
    content_base64: String,
}

#[derive(Serialize)]
struct IngestResponse {
    id: String,
    status: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if request.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let extension = match request.mime.as_str() {
        extract::MIME_PDF => "pdf",
        extract::MIME_DOCX => "docx",
        extract::MIME_TEXT => "txt",
        extract::MIME_MARKDOWN => "md",
        other => return Err(bad_request(format!("unsupported mime type: {}", other))),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&request.content_base64)
        .map_err(|e| bad_request(format!("content_base64 invalid: {}", e)))?;
    if bytes.is_empty() {
        return Err(bad_request("content must not be empty"));
    }

    let inbox: PathBuf = state.config.ingest.inbox_dir.clone();
    std::fs::create_dir_all(&inbox).map_err(|e| internal(e.to_string()))?;
    let file_path = inbox.join(format!("{}.{}", Uuid::new_v4(), extension));
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| internal(e.to_string()))?;

    let id = store::register_document(
        &state.pool,
        request.name.trim(),
        &request.source,
        &request.mime,
        &file_path.to_string_lossy(),
    )
    .await
    .map_err(|e| internal(e.to_string()))?;

    info!(document = %id, name = %request.name, "document registered via API");
    Ok(Json(IngestResponse {
        id,
        status: "pending".to_string(),
    }))
}

// ============ GET /documents/{id} ============

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<status::DocumentStatusReport>, AppError> {
    let report = status::document_status(&state.pool, &state.config, &id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    match report {
        Some(report) => Ok(Json(report)),
        None => Err(not_found(format!("no document with id {}", id))),
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    document_ids: Option<Vec<String>>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    similarity_threshold: Option<f32>,
}

#[derive(Serialize)]
struct SearchHitBody {
    chunk_id: String,
    document_id: String,
    document_name: String,
    article_number: String,
    chunk_index: i64,
    score: f32,
    text: String,
}

#[derive(Serialize)]
struct SearchResponseBody {
    hits: Vec<SearchHitBody>,
    context: String,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponseBody>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let Some(embedder) = &state.embedder else {
        return Err(AppError {
            status: StatusCode::BAD_REQUEST,
            code: "embeddings_disabled",
            message: "search requires an embedding provider".to_string(),
        });
    };

    let request = SearchRequest {
        query: body.query,
        permitted: body.document_ids,
        top_k: body.top_k.unwrap_or(state.config.retrieval.top_k),
        threshold: body
            .similarity_threshold
            .unwrap_or(state.config.retrieval.similarity_threshold),
        context_tokens: state.config.retrieval.context_token_budget,
    };

    let response = run_query(&state.pool, embedder.as_ref(), &request)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(SearchResponseBody {
        hits: response
            .hits
            .into_iter()
            .map(|hit| SearchHitBody {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                document_name: hit.document_name,
                article_number: hit.article_number,
                chunk_index: hit.chunk_index,
                score: hit.score,
                text: hit.text,
            })
            .collect(),
        context: response.context,
    }))
}
