//! Backfill pass for deferred embeddings.
//!
//! Chunks persisted without a vector (rate limits, outages, or a disabled
//! provider at ingest time) are excluded from search until this pass
//! supplies one. Runs against committed rows only and refreshes the
//! derived vector index per touched document.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{self, CachedEmbedder, Embedder};
use crate::store;

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
}

/// Counters from one backfill pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillSummary {
    pub total: u64,
    pub embedded: u64,
    pub failed: u64,
    pub reindexed: u64,
}

pub async fn run_backfill(config: &Config, pool: &SqlitePool, limit: Option<usize>) -> Result<()> {
    let Some(embedder) = embedding::create_embedder(&config.embedding)? else {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    };

    let summary =
        run_backfill_with(pool, embedder, config.embedding.batch_size, limit).await?;

    println!("embed pending");
    if summary.total == 0 {
        println!("  all chunks embedded");
        return Ok(());
    }
    println!("  total pending: {}", summary.total);
    println!("  embedded: {}", summary.embedded);
    println!("  failed: {}", summary.failed);
    println!("  documents reindexed: {}", summary.reindexed);
    Ok(())
}

/// Backfill with an explicit embedder handle (the path tests drive).
pub async fn run_backfill_with(
    pool: &SqlitePool,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    limit: Option<usize>,
) -> Result<BackfillSummary> {
    let pending = find_pending(pool, limit).await?;
    if pending.is_empty() {
        return Ok(BackfillSummary::default());
    }

    let cached = CachedEmbedder::new(embedder, pool.clone());
    let model = cached.model_name().to_string();
    let total = pending.len() as u64;
    let mut embedded = 0u64;
    let mut failed = 0u64;
    let mut touched: BTreeSet<String> = BTreeSet::new();

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match cached.embed_batch(&texts).await {
            Ok(vectors) => {
                for (item, vector) in batch.iter().zip(vectors.iter()) {
                    sqlx::query(
                        "UPDATE chunks SET embedding = ?, embedding_model = ?, deferred = 0 WHERE id = ?",
                    )
                    .bind(embedding::vec_to_blob(vector))
                    .bind(&model)
                    .bind(&item.chunk_id)
                    .execute(pool)
                    .await?;
                    touched.insert(item.document_id.clone());
                    embedded += 1;
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    // Refresh the derived vector index for every document we touched.
    for document_id in &touched {
        store::rebuild_index(pool, document_id).await?;
    }

    Ok(BackfillSummary {
        total,
        embedded,
        failed,
        reindexed: touched.len() as u64,
    })
}

async fn find_pending(pool: &SqlitePool, limit: Option<usize>) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(i64::MAX);

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.text, a.document_id
        FROM chunks c
        JOIN articles a ON a.id = c.article_id
        JOIN documents d ON d.id = a.document_id
        WHERE c.embedding IS NULL AND d.status = 'parsed'
        ORDER BY a.document_id, c.article_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
        })
        .collect())
}
