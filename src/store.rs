//! Dual-store persistence: authoritative relational rows plus the derived
//! graph/vector index.
//!
//! The relational write for one document happens in a single transaction
//! scoped to that document (delete stale rows, insert articles, then
//! chunks, then references, then mark the document parsed). The derived
//! index is rebuilt from committed rows afterwards and can be fully
//! reconstructed at any time; a failed attempt never touches it.

use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::embedding::vec_to_blob;
use crate::models::{Article, ArticleRef, CheckpointState, Chunk, Document, DocumentStatus};

/// An article with its chunks, ready for a document-scoped commit.
#[derive(Debug, Clone)]
pub struct PreparedArticle {
    pub article: Article,
    pub chunks: Vec<Chunk>,
}

/// Register a new document: one pending row plus its checkpoint.
pub async fn register_document(
    pool: &SqlitePool,
    name: &str,
    source: &str,
    mime: &str,
    source_path: &str,
) -> Result<String, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO documents (id, name, source, mime, source_path, status, degraded, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(source)
    .bind(mime)
    .bind(source_path)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT INTO checkpoints (document_id, state, attempts, updated_at) VALUES (?, 'pending', 0, ?)",
    )
    .bind(&id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(id)
}

/// Fetch one document row.
pub async fn get_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, source, mime, source_path, status, degraded, error, created_at, updated_at FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let status: String = row.get("status");
        let degraded: i64 = row.get("degraded");
        Document {
            id: row.get("id"),
            name: row.get("name"),
            source: row.get("source"),
            mime: row.get("mime"),
            source_path: row.get("source_path"),
            status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
            degraded: degraded != 0,
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }))
}

/// Commit one processed document atomically.
///
/// Stale rows from any previous attempt are deleted inside the same
/// transaction, so re-ingesting a document can never produce duplicates.
pub async fn commit_document(
    pool: &SqlitePool,
    document_id: &str,
    articles: &[PreparedArticle],
    refs: &[ArticleRef],
    degraded: bool,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query("DELETE FROM article_refs WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM chunks WHERE article_id IN (SELECT id FROM articles WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM articles WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for prepared in articles {
        let article = &prepared.article;
        sqlx::query(
            r#"
            INSERT INTO articles (id, document_id, article_number, title, full_text, status, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&article.id)
        .bind(&article.document_id)
        .bind(&article.article_number)
        .bind(&article.title)
        .bind(&article.full_text)
        .bind(article.status.as_str())
        .bind(&article.error)
        .execute(&mut *tx)
        .await?;

        for chunk in &prepared.chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, article_id, chunk_index, text, token_count,
                                    start_offset, end_offset, reasoning, embedding,
                                    embedding_model, deferred)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.article_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(&chunk.reasoning)
            .bind(chunk.embedding.as_ref().map(|v| vec_to_blob(v)))
            .bind(&chunk.embedding_model)
            .bind(chunk.deferred as i64)
            .execute(&mut *tx)
            .await?;
        }
    }

    for r in refs {
        sqlx::query(
            r#"
            INSERT INTO article_refs (document_id, source_article_id, target_article_number, ref_type, confidence)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.document_id)
        .bind(&r.source_article_id)
        .bind(&r.target_article_number)
        .bind(&r.ref_type)
        .bind(r.confidence)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE documents SET status = 'parsed', degraded = ?, error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(degraded as i64)
    .bind(now)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Rebuild the derived graph/vector index for one document from its
/// committed relational rows.
pub async fn rebuild_index(pool: &SqlitePool, document_id: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM graph_edges WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM graph_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    let doc_row = sqlx::query("SELECT name FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(doc_row) = doc_row else {
        tx.commit().await?;
        return Ok(());
    };
    let doc_name: String = doc_row.get("name");

    let doc_node = format!("doc:{}", document_id);
    sqlx::query(
        "INSERT INTO graph_nodes (id, kind, document_id, article_id, label) VALUES (?, 'document', ?, NULL, ?)",
    )
    .bind(&doc_node)
    .bind(document_id)
    .bind(&doc_name)
    .execute(&mut *tx)
    .await?;

    let article_rows = sqlx::query(
        "SELECT id, article_number, title FROM articles WHERE document_id = ? ORDER BY article_number",
    )
    .bind(document_id)
    .fetch_all(&mut *tx)
    .await?;

    for row in &article_rows {
        let article_id: String = row.get("id");
        let number: String = row.get("article_number");
        let title: Option<String> = row.get("title");
        let node_id = format!("article:{}", article_id);
        let label = match title {
            Some(t) => format!("Artikel {} — {}", number, t),
            None => format!("Artikel {}", number),
        };

        sqlx::query(
            "INSERT INTO graph_nodes (id, kind, document_id, article_id, label) VALUES (?, 'article', ?, ?, ?)",
        )
        .bind(&node_id)
        .bind(document_id)
        .bind(&article_id)
        .bind(&label)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO graph_edges (document_id, source_node, target_node, kind, confidence) VALUES (?, ?, ?, 'contains', 1.0)",
        )
        .bind(document_id)
        .bind(&doc_node)
        .bind(&node_id)
        .execute(&mut *tx)
        .await?;
    }

    let ref_rows = sqlx::query(
        r#"
        SELECT r.source_article_id, r.target_article_number, r.ref_type, r.confidence, a.id AS target_id
        FROM article_refs r
        JOIN articles a ON a.document_id = r.document_id AND a.article_number = r.target_article_number
        WHERE r.document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_all(&mut *tx)
    .await?;

    for row in &ref_rows {
        let source_id: String = row.get("source_article_id");
        let target_id: String = row.get("target_id");
        let ref_type: String = row.get("ref_type");
        let confidence: f64 = row.get("confidence");
        sqlx::query(
            "INSERT INTO graph_edges (document_id, source_node, target_node, kind, confidence) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(format!("article:{}", source_id))
        .bind(format!("article:{}", target_id))
        .bind(&ref_type)
        .bind(confidence)
        .execute(&mut *tx)
        .await?;
    }

    let chunk_rows = sqlx::query(
        r#"
        SELECT c.id, c.article_id, c.embedding, c.embedding_model
        FROM chunks c
        JOIN articles a ON a.id = c.article_id
        WHERE a.document_id = ? AND c.embedding IS NOT NULL
        "#,
    )
    .bind(document_id)
    .fetch_all(&mut *tx)
    .await?;

    for row in &chunk_rows {
        let chunk_id: String = row.get("id");
        let article_id: String = row.get("article_id");
        let blob: Vec<u8> = row.get("embedding");
        let model: Option<String> = row.get("embedding_model");
        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, article_id, model, embedding) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(document_id)
        .bind(&article_id)
        .bind(model.unwrap_or_default())
        .bind(blob)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Reconciliation: rebuild the derived index for every parsed document.
pub async fn rebuild_all(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM documents WHERE status = 'parsed' ORDER BY created_at")
            .fetch_all(pool)
            .await?;

    let count = ids.len() as u64;
    for id in &ids {
        rebuild_index(pool, id).await?;
    }
    info!(documents = count, "derived index rebuilt");
    Ok(count)
}

/// Mark a document terminally failed with a reason.
pub async fn mark_document_failed(
    pool: &SqlitePool,
    document_id: &str,
    reason: &str,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET status = 'failed', error = ?, updated_at = ? WHERE id = ?")
        .bind(reason)
        .bind(now)
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flip a document's status (used for claim/requeue transitions).
pub async fn set_document_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Write a checkpoint transition. Attempts only move via
/// [`bump_checkpoint_attempts`].
pub async fn set_checkpoint(
    pool: &SqlitePool,
    document_id: &str,
    state: CheckpointState,
    reason: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (document_id, state, reason, attempts, updated_at)
        VALUES (?, ?, ?, 0, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            state = excluded.state,
            reason = excluded.reason,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(document_id)
    .bind(state.as_str())
    .bind(reason)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn bump_checkpoint_attempts(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<i64, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE checkpoints SET attempts = attempts + 1, updated_at = ? WHERE document_id = ?")
        .bind(now)
        .bind(document_id)
        .execute(pool)
        .await?;
    sqlx::query_scalar("SELECT attempts FROM checkpoints WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await
}

/// Force a checkpoint into terminal failed state (no further retries).
pub async fn fail_checkpoint_terminal(
    pool: &SqlitePool,
    document_id: &str,
    reason: &str,
    max_attempts: i64,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE checkpoints SET state = 'failed', reason = ?, attempts = ?, updated_at = ? WHERE document_id = ?",
    )
    .bind(reason)
    .bind(max_attempts)
    .bind(now)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Treat checkpoints left `in_progress` by a crash as failed-and-retriable.
/// Safe because commits are document-scoped and atomic: nothing partial
/// can exist for these documents.
pub async fn recover_interrupted(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE checkpoints
        SET state = 'failed', reason = 'interrupted by restart', updated_at = ?
        WHERE state = 'in_progress'
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        sqlx::query(
            r#"
            UPDATE documents SET status = 'pending', updated_at = ?
            WHERE status = 'processing'
            "#,
        )
        .bind(now)
        .execute(pool)
        .await?;
    }

    Ok(result.rows_affected())
}

/// Controlled reset-and-reprocess: delete the document's rows and derived
/// index entries, then requeue it.
pub async fn reset_document(pool: &SqlitePool, document_id: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = chrono::Utc::now().timestamp();

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM graph_edges WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM graph_nodes WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM article_refs WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM chunks WHERE article_id IN (SELECT id FROM articles WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM articles WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "UPDATE documents SET status = 'pending', degraded = 0, error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE checkpoints SET state = 'pending', reason = NULL, attempts = 0, updated_at = ? WHERE document_id = ?",
    )
    .bind(now)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// A queued unit of work for the orchestrator.
#[derive(Debug, Clone)]
pub struct QueuedDocument {
    pub id: String,
    pub name: String,
    pub mime: String,
    pub source_path: String,
    pub attempts: i64,
}

/// Documents ready for processing: pending, or failed with attempts left.
pub async fn load_queue(
    pool: &SqlitePool,
    max_attempts: i64,
    limit: Option<usize>,
) -> Result<Vec<QueuedDocument>, sqlx::Error> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(i64::MAX);
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.name, d.mime, d.source_path, c.attempts
        FROM documents d
        JOIN checkpoints c ON c.document_id = d.id
        WHERE c.state IN ('pending', 'failed')
          AND c.attempts < ?
          AND d.status IN ('pending', 'failed')
        ORDER BY d.created_at
        LIMIT ?
        "#,
    )
    .bind(max_attempts)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| QueuedDocument {
            id: row.get("id"),
            name: row.get("name"),
            mime: row.get("mime"),
            source_path: row.get("source_path"),
            attempts: row.get("attempts"),
        })
        .collect())
}
