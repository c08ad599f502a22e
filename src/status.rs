//! Document status and corpus statistics.
//!
//! The per-document report is the operator's view of §7 error semantics:
//! it always distinguishes "failed, retriable" from "parsed with degraded
//! quality" so reruns can be targeted.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;

/// Everything the status interface exposes for one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatusReport {
    pub id: String,
    pub name: String,
    pub source: String,
    pub status: String,
    pub degraded: bool,
    pub error: Option<String>,
    pub checkpoint_state: String,
    pub attempts: i64,
    /// Failed but still within the retry budget.
    pub retriable: bool,
    pub articles_parsed: i64,
    pub chunks_created: i64,
    pub chunks_embedded: i64,
    pub chunks_deferred: i64,
}

pub async fn document_status(
    pool: &SqlitePool,
    config: &Config,
    document_id: &str,
) -> Result<Option<DocumentStatusReport>> {
    let row = sqlx::query(
        r#"
        SELECT d.id, d.name, d.source, d.status, d.degraded, d.error,
               c.state AS checkpoint_state, c.attempts
        FROM documents d
        JOIN checkpoints c ON c.document_id = d.id
        WHERE d.id = ?
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let articles_parsed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM articles WHERE document_id = ? AND status != 'failed'",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let chunks_created: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunks c JOIN articles a ON a.id = c.article_id WHERE a.document_id = ?",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let chunks_embedded: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM chunks c
        JOIN articles a ON a.id = c.article_id
        WHERE a.document_id = ? AND c.embedding IS NOT NULL
        "#,
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let chunks_deferred: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM chunks c
        JOIN articles a ON a.id = c.article_id
        WHERE a.document_id = ? AND c.embedding IS NULL AND c.deferred = 1
        "#,
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let status: String = row.get("status");
    let checkpoint_state: String = row.get("checkpoint_state");
    let attempts: i64 = row.get("attempts");
    let degraded: i64 = row.get("degraded");

    Ok(Some(DocumentStatusReport {
        id: row.get("id"),
        name: row.get("name"),
        source: row.get("source"),
        retriable: status == "failed" && attempts < config.orchestrator.max_attempts,
        status,
        degraded: degraded != 0,
        error: row.get("error"),
        checkpoint_state,
        attempts,
        articles_parsed,
        chunks_created,
        chunks_embedded,
        chunks_deferred,
    }))
}

pub fn print_document_status(report: &DocumentStatusReport) {
    let status_display = if report.status == "failed" {
        if report.retriable {
            "failed (retriable)".to_string()
        } else {
            "failed (terminal)".to_string()
        }
    } else if report.degraded {
        format!("{} (degraded chunking)", report.status)
    } else {
        report.status.clone()
    };

    println!("{} — {}", report.id, report.name);
    println!("  source:          {}", report.source);
    println!("  status:          {}", status_display);
    println!(
        "  checkpoint:      {} (attempts: {})",
        report.checkpoint_state, report.attempts
    );
    println!("  articles parsed: {}", report.articles_parsed);
    println!("  chunks created:  {}", report.chunks_created);
    println!(
        "  chunks embedded: {} ({} deferred)",
        report.chunks_embedded, report.chunks_deferred
    );
    if let Some(error) = &report.error {
        println!("  error:           {}", error);
    }
}

/// Corpus-wide stats summary.
pub async fn run_stats(pool: &SqlitePool, config: &Config) -> Result<()> {
    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Accord Index — Corpus Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );

    let status_rows = sqlx::query(
        r#"
        SELECT d.status, COUNT(*) AS doc_count, SUM(d.degraded) AS degraded_count
        FROM documents d
        GROUP BY d.status
        ORDER BY doc_count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !status_rows.is_empty() {
        println!();
        println!("  By status:");
        println!("  {:<12} {:>6} {:>10}", "STATUS", "DOCS", "DEGRADED");
        println!("  {}", "-".repeat(32));
        for row in &status_rows {
            let status: String = row.get("status");
            let doc_count: i64 = row.get("doc_count");
            let degraded: Option<i64> = row.get("degraded_count");
            println!(
                "  {:<12} {:>6} {:>10}",
                status,
                doc_count,
                degraded.unwrap_or(0)
            );
        }
    }

    println!();
    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_bands() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
