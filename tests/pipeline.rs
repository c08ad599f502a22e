//! End-to-end ingestion scenarios: clean runs, degraded chunking,
//! deferral, resumability, and resource-pressure requeues, all against
//! a real temporary SQLite database with scripted capabilities.

mod common;

use std::sync::Arc;

use sqlx::Row;

use accord_index::ingest;
use accord_index::monitor::{MemoryThresholds, ResourceMonitor};
use accord_index::orchestrator::run_batch;
use accord_index::store;

use common::*;

async fn register_agreement(
    pool: &sqlx::SqlitePool,
    config: &accord_index::config::Config,
    dir: &std::path::Path,
    file_name: &str,
) -> String {
    let path = write_agreement(dir, file_name);
    let ids = ingest::register_path(pool, config, &path, None, "test")
        .await
        .expect("register");
    assert_eq!(ids.len(), 1);
    ids[0].clone()
}

async fn count(pool: &sqlx::SqlitePool, sql: &str, document_id: &str) -> i64 {
    sqlx::query_scalar(sql)
        .bind(document_id)
        .fetch_one(pool)
        .await
        .expect("count query")
}

const COUNT_ARTICLES: &str = "SELECT COUNT(*) FROM articles WHERE document_id = ?";
const COUNT_CHUNKS: &str =
    "SELECT COUNT(*) FROM chunks c JOIN articles a ON a.id = c.article_id WHERE a.document_id = ?";
const COUNT_EMBEDDED: &str = "SELECT COUNT(*) FROM chunks c JOIN articles a ON a.id = c.article_id WHERE a.document_id = ? AND c.embedding IS NOT NULL";

#[tokio::test]
async fn clean_run_parses_three_articles_with_embeddings() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao_voorbeeld.txt").await;

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.failed, 0);

    let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "parsed");

    let degraded: i64 = sqlx::query_scalar("SELECT degraded FROM documents WHERE id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(degraded, 0);

    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);
    let chunks = count(&pool, COUNT_CHUNKS, &doc_id).await;
    assert!((3..=9).contains(&chunks), "1-3 chunks per article, got {}", chunks);
    assert_eq!(count(&pool, COUNT_EMBEDDED, &doc_id).await, chunks);

    // Derived index mirrors the relational rows.
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vectors, chunks);

    let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_nodes WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(nodes, 4); // one document node + three article nodes
}

#[tokio::test]
async fn chunk_indices_are_contiguous_per_article() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    // Fallback splitting with a small budget produces several chunks.
    let mut config = config;
    config.chunking.target_tokens = 20;
    config.chunking.overlap_tokens = 0;

    let ctx = context(
        &pool,
        &config,
        Arc::new(UnavailableProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    run_batch(ctx, cancel_rx(), None).await.expect("run");

    let rows = sqlx::query(
        r#"
        SELECT c.article_id, c.chunk_index
        FROM chunks c JOIN articles a ON a.id = c.article_id
        WHERE a.document_id = ?
        ORDER BY c.article_id, c.chunk_index
        "#,
    )
    .bind(&doc_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert!(!rows.is_empty());

    let mut current_article = String::new();
    let mut expected = 0i64;
    for row in &rows {
        let article_id: String = row.get("article_id");
        let index: i64 = row.get("chunk_index");
        if article_id != current_article {
            current_article = article_id;
            expected = 0;
        }
        assert_eq!(index, expected, "gap in chunk indices");
        expected += 1;
    }
}

#[tokio::test]
async fn unavailable_reasoning_degrades_but_still_parses() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let ctx = context(
        &pool,
        &config,
        Arc::new(UnavailableProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.failed, 0);

    let row = sqlx::query("SELECT status, degraded FROM documents WHERE id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: String = row.get("status");
    let degraded: i64 = row.get("degraded");
    assert_eq!(status, "parsed");
    assert_eq!(degraded, 1);
}

#[tokio::test]
async fn done_documents_are_skipped_on_rerun() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let make_ctx = || {
        context(
            &pool,
            &config,
            Arc::new(WholeArticleProposer),
            Some(Arc::new(HashEmbedder)),
            quiet_monitor(),
        )
    };

    let first = run_batch(make_ctx(), cancel_rx(), None).await.expect("run");
    assert_eq!(first.parsed, 1);
    let chunks_before = count(&pool, COUNT_CHUNKS, &doc_id).await;

    let second = run_batch(make_ctx(), cancel_rx(), None).await.expect("rerun");
    assert_eq!(second.parsed, 0);
    assert_eq!(count(&pool, COUNT_CHUNKS, &doc_id).await, chunks_before);
}

#[tokio::test]
async fn forced_reprocess_produces_no_duplicate_rows() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let make_ctx = || {
        context(
            &pool,
            &config,
            Arc::new(WholeArticleProposer),
            Some(Arc::new(HashEmbedder)),
            quiet_monitor(),
        )
    };

    run_batch(make_ctx(), cancel_rx(), None).await.expect("run");
    let chunks_before = count(&pool, COUNT_CHUNKS, &doc_id).await;

    // Force the document back through the pipeline.
    sqlx::query("UPDATE checkpoints SET state = 'pending', attempts = 0 WHERE document_id = ?")
        .bind(&doc_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE documents SET status = 'pending' WHERE id = ?")
        .bind(&doc_id)
        .execute(&pool)
        .await
        .unwrap();

    let summary = run_batch(make_ctx(), cancel_rx(), None).await.expect("rerun");
    assert_eq!(summary.parsed, 1);

    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);
    assert_eq!(count(&pool, COUNT_CHUNKS, &doc_id).await, chunks_before);

    // (article_id, chunk_index) stays unique.
    let total: i64 = count(&pool, COUNT_CHUNKS, &doc_id).await;
    let distinct: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT DISTINCT c.article_id, c.chunk_index
            FROM chunks c JOIN articles a ON a.id = c.article_id
            WHERE a.document_id = ?
        )
        "#,
    )
    .bind(&doc_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(total, distinct);
}

#[tokio::test]
async fn interrupted_in_progress_checkpoint_is_recovered() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    // Simulate a crash mid-processing: checkpoint in_progress, document
    // claimed, nothing committed.
    sqlx::query("UPDATE checkpoints SET state = 'in_progress' WHERE document_id = ?")
        .bind(&doc_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE documents SET status = 'processing' WHERE id = ?")
        .bind(&doc_id)
        .execute(&pool)
        .await
        .unwrap();

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");
    assert_eq!(summary.parsed, 1);

    let state: String = sqlx::query_scalar("SELECT state FROM checkpoints WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(state, "done");
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);
}

#[tokio::test]
async fn exhausted_embedding_defers_chunks_then_backfill_completes() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(ExhaustedEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");

    // Deferral never fails the document.
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(count(&pool, COUNT_EMBEDDED, &doc_id).await, 0);

    let deferred: i64 = count(
        &pool,
        "SELECT COUNT(*) FROM chunks c JOIN articles a ON a.id = c.article_id WHERE a.document_id = ? AND c.deferred = 1",
        &doc_id,
    )
    .await;
    assert!(deferred > 0);

    // Deferred chunks are excluded from the vector index until backfilled.
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vectors, 0);

    let backfill = accord_index::backfill::run_backfill_with(
        &pool,
        Arc::new(HashEmbedder),
        64,
        None,
    )
    .await
    .expect("backfill");
    assert_eq!(backfill.failed, 0);
    assert_eq!(backfill.embedded as i64, deferred);

    let chunks = count(&pool, COUNT_CHUNKS, &doc_id).await;
    assert_eq!(count(&pool, COUNT_EMBEDDED, &doc_id).await, chunks);
    let vectors_after: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
            .bind(&doc_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(vectors_after, chunks);
}

#[tokio::test]
async fn hard_memory_pressure_requeues_then_succeeds_without_duplicates() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let mut config = config;
    config.orchestrator.workers = Some(1);

    // Sample sequence: admission normal, first in-flight check hard
    // (sampled twice: classification + event payload), then calm.
    let monitor = Arc::new(ResourceMonitor::with_sampler(
        Box::new(SequenceSampler::new(vec![100, 950, 950, 100])),
        MemoryThresholds {
            soft_pct: 80,
            hard_pct: 92,
        },
    ));

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        monitor,
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.failed, 0);

    // Exactly one row set exists after the retry.
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);
    let total = count(&pool, COUNT_CHUNKS, &doc_id).await;
    let distinct: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT DISTINCT c.article_id, c.chunk_index
            FROM chunks c JOIN articles a ON a.id = c.article_id
            WHERE a.document_id = ?
        )
        "#,
    )
    .bind(&doc_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(total, distinct);

    let attempts: i64 = sqlx::query_scalar("SELECT attempts FROM checkpoints WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn stalled_document_exhausts_attempts_and_fails_terminally() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let mut config = config;
    config.orchestrator.workers = Some(1);
    config.orchestrator.document_timeout_secs = 0;
    config.orchestrator.max_attempts = 2;

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");

    assert_eq!(summary.parsed, 0);
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.failed, 1);

    let row = sqlx::query("SELECT status, error FROM documents WHERE id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: String = row.get("status");
    let error: Option<String> = row.get("error");
    assert_eq!(status, "failed");
    assert!(error.unwrap_or_default().contains("stalled"));

    // Nothing partial was ever committed.
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 0);
}

#[tokio::test]
async fn invalid_bytes_fail_the_document_terminally() {
    let (tmp, config, pool) = setup().await;
    let path = tmp.path().join("broken.txt");
    std::fs::write(&path, [0xff, 0xfe, 0x00, 0x41]).unwrap();
    let ids = ingest::register_path(&pool, &config, &path, None, "test")
        .await
        .expect("register");
    let doc_id = ids[0].clone();

    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let summary = run_batch(ctx, cancel_rx(), None).await.expect("run");
    assert_eq!(summary.failed, 1);

    let row = sqlx::query("SELECT status, error FROM documents WHERE id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: String = row.get("status");
    let error: Option<String> = row.get("error");
    assert_eq!(status, "failed");
    assert!(error.unwrap_or_default().contains("extraction failed"));

    // Terminal: a rerun does not pick the document up again.
    let ctx = context(
        &pool,
        &config,
        Arc::new(WholeArticleProposer),
        Some(Arc::new(HashEmbedder)),
        quiet_monitor(),
    );
    let rerun = run_batch(ctx, cancel_rx(), None).await.expect("rerun");
    assert_eq!(rerun.failed, 0);
    assert_eq!(rerun.parsed, 0);
}

#[tokio::test]
async fn reset_deletes_rows_and_requeues() {
    let (tmp, config, pool) = setup().await;
    let doc_id = register_agreement(&pool, &config, tmp.path(), "cao.txt").await;

    let make_ctx = || {
        context(
            &pool,
            &config,
            Arc::new(WholeArticleProposer),
            Some(Arc::new(HashEmbedder)),
            quiet_monitor(),
        )
    };

    run_batch(make_ctx(), cancel_rx(), None).await.expect("run");
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);

    store::reset_document(&pool, &doc_id).await.expect("reset");
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 0);
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
        .bind(&doc_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vectors, 0);

    let summary = run_batch(make_ctx(), cancel_rx(), None).await.expect("rerun");
    assert_eq!(summary.parsed, 1);
    assert_eq!(count(&pool, COUNT_ARTICLES, &doc_id).await, 3);
}
