//! Batch orchestration: a bounded worker pool over the document queue.
//!
//! Each worker processes one document end-to-end (extract → segment →
//! chunk → embed → commit → reindex) before taking the next, which bounds
//! peak memory to roughly one document's working set per worker.
//!
//! Checkpoint protocol: `in_progress` is written before extraction
//! starts; `done`/`failed` only after the document-scoped transaction
//! commits or definitively fails. Because commits are atomic per
//! document, an `in_progress` checkpoint surviving a restart proves
//! nothing partial exists, so the document is simply requeued.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use sqlx::SqlitePool;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::article;
use crate::chunker;
use crate::config::Config;
use crate::embedding::{CachedEmbedder, Embedder};
use crate::error::{storage_error, PipelineError};
use crate::extract::{self, ExtractError};
use crate::models::{Article, ArticleRef, ArticleStatus, CheckpointState, Chunk, DocumentStatus};
use crate::monitor::{MemoryPressure, ResourceMonitor};
use crate::progress::{BatchEvent, ProgressReporter};
use crate::reasoning::ChunkProposer;
use crate::store::{self, PreparedArticle, QueuedDocument};

const ADMISSION_WAIT: Duration = Duration::from_millis(500);
const MAX_ADMISSION_WAITS: u32 = 20;

/// Everything a batch run needs, injected explicitly so the orchestrator
/// is testable with scripted capabilities and samplers.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Config,
    pub proposer: Arc<dyn ChunkProposer>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub monitor: Arc<ResourceMonitor>,
    pub reporter: Arc<dyn ProgressReporter>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSummary {
    pub parsed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub skipped: u64,
}

/// Per-document counters surfaced through progress events and status.
#[derive(Debug, Default, Clone, Copy)]
struct DocReport {
    articles: u64,
    chunks: u64,
    embedded: u64,
    deferred: u64,
    degraded: bool,
}

enum DocOutcome {
    Parsed,
    Requeued,
    Failed,
    Skipped,
    Fatal(PipelineError),
}

/// Run the batch until the queue drains, the limit is reached, or the
/// run is cancelled. Only loss of the relational store aborts with an
/// error; per-document failures are recorded and skipped past.
pub async fn run_batch(
    ctx: Arc<PipelineContext>,
    cancel: watch::Receiver<bool>,
    limit: Option<usize>,
) -> Result<BatchSummary, PipelineError> {
    let recovered = store::recover_interrupted(&ctx.pool)
        .await
        .map_err(storage_error)?;
    if recovered > 0 {
        info!(documents = recovered, "requeued documents interrupted by an earlier crash");
    }

    let workers = ctx.config.orchestrator.effective_workers();
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut summary = BatchSummary::default();
    let mut remaining = limit;

    loop {
        if *cancel.borrow() {
            break;
        }
        let queue = store::load_queue(&ctx.pool, ctx.config.orchestrator.max_attempts, remaining)
            .await
            .map_err(storage_error)?;
        if queue.is_empty() {
            break;
        }
        let claimed = queue.len();

        let mut join_set = JoinSet::new();
        for doc in queue {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("worker semaphore never closed");
                process_one(ctx, doc, cancel).await
            });
        }

        let mut fatal = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(DocOutcome::Parsed) => summary.parsed += 1,
                Ok(DocOutcome::Requeued) => summary.requeued += 1,
                Ok(DocOutcome::Failed) => summary.failed += 1,
                Ok(DocOutcome::Skipped) => summary.skipped += 1,
                Ok(DocOutcome::Fatal(err)) => {
                    error!(error = %err, "infrastructure failure, aborting batch run");
                    join_set.abort_all();
                    fatal = Some(err);
                }
                Err(join_err) => {
                    warn!(error = %join_err, "worker task aborted");
                    summary.failed += 1;
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        if let Some(lim) = remaining {
            let next = lim.saturating_sub(claimed);
            if next == 0 {
                break;
            }
            remaining = Some(next);
        }
    }

    Ok(summary)
}

async fn process_one(
    ctx: Arc<PipelineContext>,
    doc: QueuedDocument,
    cancel: watch::Receiver<bool>,
) -> DocOutcome {
    if *cancel.borrow() {
        return DocOutcome::Skipped;
    }

    // Admission throttle: new documents wait while the soft threshold is
    // breached; persistent pressure requeues without claiming.
    let mut waits = 0u32;
    while ctx.monitor.pressure() != MemoryPressure::Normal {
        let sample = ctx.monitor.sample();
        ctx.reporter.report(BatchEvent::ResourcePressure {
            used_mb: sample.used_mb,
            total_mb: sample.total_mb,
        });
        warn!(
            used_mb = sample.used_mb,
            total_mb = sample.total_mb,
            "memory pressure, throttling document admission"
        );
        waits += 1;
        if waits >= MAX_ADMISSION_WAITS {
            return requeue(
                &ctx,
                &doc,
                &PipelineError::ResourceExhaustion {
                    used_mb: sample.used_mb,
                    total_mb: sample.total_mb,
                },
            )
            .await;
        }
        tokio::time::sleep(ADMISSION_WAIT).await;
        if *cancel.borrow() {
            return DocOutcome::Skipped;
        }
    }

    // Claim: checkpoint goes in_progress before any extraction work.
    if let Err(err) = claim(&ctx.pool, &doc.id).await {
        return storage_outcome(&ctx, &doc, err).await;
    }
    ctx.reporter.report(BatchEvent::Claimed {
        document: doc.id.clone(),
        name: doc.name.clone(),
    });

    let budget = Duration::from_secs(ctx.config.orchestrator.document_timeout_secs);
    let result = match tokio::time::timeout(budget, process_document(&ctx, &doc)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Stalled(
            ctx.config.orchestrator.document_timeout_secs,
        )),
    };

    match result {
        Ok(report) => {
            if let Err(err) =
                store::set_checkpoint(&ctx.pool, &doc.id, CheckpointState::Done, None).await
            {
                return storage_outcome(&ctx, &doc, storage_error(err)).await;
            }
            info!(
                document = %doc.id,
                articles = report.articles,
                chunks = report.chunks,
                embedded = report.embedded,
                degraded = report.degraded,
                "document parsed"
            );
            ctx.reporter.report(BatchEvent::Parsed {
                document: doc.id.clone(),
                articles: report.articles,
                chunks: report.chunks,
                embedded: report.embedded,
                deferred: report.deferred,
                degraded: report.degraded,
            });
            DocOutcome::Parsed
        }
        Err(err) if err.is_fatal_for_run() => DocOutcome::Fatal(err),
        Err(err) if err.is_retriable() => requeue(&ctx, &doc, &err).await,
        Err(err) => fail_terminal(&ctx, &doc, &err).await,
    }
}

async fn claim(pool: &SqlitePool, document_id: &str) -> Result<(), PipelineError> {
    store::set_checkpoint(pool, document_id, CheckpointState::InProgress, None)
        .await
        .map_err(storage_error)?;
    store::set_document_status(pool, document_id, DocumentStatus::Processing)
        .await
        .map_err(storage_error)?;
    Ok(())
}

/// Retriable failure: bump attempts and put the document back in the
/// queue, unless the retry budget is now exhausted.
async fn requeue(ctx: &PipelineContext, doc: &QueuedDocument, err: &PipelineError) -> DocOutcome {
    let reason = err.to_string();
    warn!(document = %doc.id, reason = %reason, "requeueing document");

    let attempts = match store::bump_checkpoint_attempts(&ctx.pool, &doc.id).await {
        Ok(attempts) => attempts,
        Err(e) => return storage_outcome(ctx, doc, storage_error(e)).await,
    };

    if attempts >= ctx.config.orchestrator.max_attempts {
        return fail_terminal(ctx, doc, err).await;
    }

    if let Err(e) =
        store::set_checkpoint(&ctx.pool, &doc.id, CheckpointState::Failed, Some(&reason)).await
    {
        return storage_outcome(ctx, doc, storage_error(e)).await;
    }
    if let Err(e) = store::set_document_status(&ctx.pool, &doc.id, DocumentStatus::Pending).await {
        return storage_outcome(ctx, doc, storage_error(e)).await;
    }

    ctx.reporter.report(BatchEvent::Requeued {
        document: doc.id.clone(),
        reason,
    });
    DocOutcome::Requeued
}

async fn fail_terminal(ctx: &PipelineContext, doc: &QueuedDocument, err: &PipelineError) -> DocOutcome {
    let reason = err.to_string();
    error!(document = %doc.id, reason = %reason, "document failed");

    if let Err(e) = store::mark_document_failed(&ctx.pool, &doc.id, &reason).await {
        return storage_outcome(ctx, doc, storage_error(e)).await;
    }
    if let Err(e) = store::fail_checkpoint_terminal(
        &ctx.pool,
        &doc.id,
        &reason,
        ctx.config.orchestrator.max_attempts,
    )
    .await
    {
        return storage_outcome(ctx, doc, storage_error(e)).await;
    }

    ctx.reporter.report(BatchEvent::Failed {
        document: doc.id.clone(),
        reason,
    });
    DocOutcome::Failed
}

/// Bookkeeping writes themselves failed. Connection loss escalates to a
/// run abort; anything else counts the document failed.
async fn storage_outcome(
    ctx: &PipelineContext,
    doc: &QueuedDocument,
    err: PipelineError,
) -> DocOutcome {
    if err.is_fatal_for_run() {
        return DocOutcome::Fatal(err);
    }
    error!(document = %doc.id, error = %err, "storage bookkeeping failed");
    ctx.reporter.report(BatchEvent::Failed {
        document: doc.id.clone(),
        reason: err.to_string(),
    });
    DocOutcome::Failed
}

fn check_pressure(ctx: &PipelineContext) -> Result<(), PipelineError> {
    if ctx.monitor.pressure() == MemoryPressure::Hard {
        let sample = ctx.monitor.sample();
        ctx.reporter.report(BatchEvent::ResourcePressure {
            used_mb: sample.used_mb,
            total_mb: sample.total_mb,
        });
        return Err(PipelineError::ResourceExhaustion {
            used_mb: sample.used_mb,
            total_mb: sample.total_mb,
        });
    }
    Ok(())
}

/// The full per-document pipeline. Nothing is persisted until the final
/// document-scoped commit, so bailing out anywhere leaves no partial
/// state.
async fn process_document(
    ctx: &PipelineContext,
    doc: &QueuedDocument,
) -> Result<DocReport, PipelineError> {
    let bytes = tokio::fs::read(&doc.source_path)
        .await
        .map_err(|e| PipelineError::Extraction(ExtractError::Unreadable(e.to_string())))?;
    let text = extract::extract_text(&bytes, &doc.mime)?;
    drop(bytes);

    check_pressure(ctx)?;

    let spans = article::segment(&text);
    let mut prepared: Vec<PreparedArticle> = Vec::with_capacity(spans.len());
    let mut degraded = false;

    for span in &spans {
        let outcome =
            chunker::chunk_article(ctx.proposer.as_ref(), &ctx.config.chunking, &span.text).await;
        degraded |= outcome.degraded;

        let article_id = Uuid::new_v4().to_string();
        let status = if outcome.chunks.is_empty() {
            ArticleStatus::Empty
        } else {
            ArticleStatus::Parsed
        };

        let chunks: Vec<Chunk> = outcome
            .chunks
            .into_iter()
            .enumerate()
            .map(|(i, piece)| Chunk {
                id: Uuid::new_v4().to_string(),
                article_id: article_id.clone(),
                chunk_index: i as i64,
                text: piece.text,
                token_count: piece.token_count as i64,
                start_offset: (span.start_offset + piece.start_offset) as i64,
                end_offset: (span.start_offset + piece.end_offset) as i64,
                reasoning: piece.reasoning,
                embedding: None,
                embedding_model: None,
                deferred: false,
            })
            .collect();

        prepared.push(PreparedArticle {
            article: Article {
                id: article_id,
                document_id: doc.id.clone(),
                article_number: span.number.clone(),
                title: span.title.clone(),
                full_text: span.text.clone(),
                status,
                error: None,
            },
            chunks,
        });
    }

    check_pressure(ctx)?;

    let (embedded, deferred) = embed_prepared(ctx, &mut prepared).await;
    let refs = extract_refs(&prepared);

    check_pressure(ctx)?;

    store::commit_document(&ctx.pool, &doc.id, &prepared, &refs, degraded)
        .await
        .map_err(storage_error)?;
    store::rebuild_index(&ctx.pool, &doc.id)
        .await
        .map_err(storage_error)?;

    let chunks: u64 = prepared.iter().map(|p| p.chunks.len() as u64).sum();
    Ok(DocReport {
        articles: prepared.len() as u64,
        chunks,
        embedded,
        deferred,
        degraded,
    })
}

/// Embed every chunk, batch by batch. Embedding failure defers the
/// affected chunks instead of failing the document.
async fn embed_prepared(ctx: &PipelineContext, prepared: &mut [PreparedArticle]) -> (u64, u64) {
    let mut slots: Vec<(usize, usize)> = Vec::new();
    for (ai, article) in prepared.iter().enumerate() {
        for ci in 0..article.chunks.len() {
            slots.push((ai, ci));
        }
    }
    if slots.is_empty() {
        return (0, 0);
    }

    let Some(embedder) = &ctx.embedder else {
        // No provider configured: everything waits for a backfill pass.
        for &(ai, ci) in &slots {
            prepared[ai].chunks[ci].deferred = true;
        }
        return (0, slots.len() as u64);
    };

    let cached = CachedEmbedder::new(embedder.clone(), ctx.pool.clone());
    let model = cached.model_name().to_string();
    let batch_size = ctx.config.embedding.batch_size.max(1);

    let mut embedded = 0u64;
    let mut deferred = 0u64;

    for batch in slots.chunks(batch_size) {
        let texts: Vec<String> = batch
            .iter()
            .map(|&(ai, ci)| prepared[ai].chunks[ci].text.clone())
            .collect();

        match cached.embed_batch(&texts).await {
            Ok(vectors) => {
                for (&(ai, ci), vector) in batch.iter().zip(vectors.into_iter()) {
                    let chunk = &mut prepared[ai].chunks[ci];
                    chunk.embedding = Some(vector);
                    chunk.embedding_model = Some(model.clone());
                    chunk.deferred = false;
                    embedded += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, "embedding batch failed, deferring chunks");
                for &(ai, ci) in batch {
                    prepared[ai].chunks[ci].deferred = true;
                    deferred += 1;
                }
            }
        }
    }

    (embedded, deferred)
}

/// Advisory cross-references: scan article text for mentions of other
/// article numbers in the same document.
fn extract_refs(prepared: &[PreparedArticle]) -> Vec<ArticleRef> {
    let re = Regex::new(r"(?i)\b(?:artikel|art\.|article)\s+(\d+[a-z]?)\b")
        .expect("reference pattern is valid");

    let mut refs = Vec::new();
    for source in prepared {
        let own = source.article.article_number.to_lowercase();
        let mut seen: Vec<String> = Vec::new();
        // Skip the article's own heading mention.
        for cap in re.captures_iter(&source.article.full_text) {
            let target = cap[1].to_lowercase();
            if target == own || seen.contains(&target) {
                continue;
            }
            // Only reference numbers that exist in this document.
            if !prepared
                .iter()
                .any(|p| p.article.article_number.to_lowercase() == target)
            {
                continue;
            }
            seen.push(target.clone());
            refs.push(ArticleRef {
                document_id: source.article.document_id.clone(),
                source_article_id: source.article.id.clone(),
                target_article_number: target,
                ref_type: "references".to_string(),
                confidence: 0.6,
            });
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(document_id: &str, number: &str, text: &str) -> PreparedArticle {
        PreparedArticle {
            article: Article {
                id: format!("a-{}", number),
                document_id: document_id.to_string(),
                article_number: number.to_string(),
                title: None,
                full_text: text.to_string(),
                status: ArticleStatus::Parsed,
                error: None,
            },
            chunks: Vec::new(),
        }
    }

    #[test]
    fn refs_found_for_existing_articles_only() {
        let articles = vec![
            prepared("d1", "1", "Artikel 1 Begrippen\nZie artikel 3 voor overwerk en artikel 9 voor niets."),
            prepared("d1", "3", "Artikel 3 Overwerk\nInhoud."),
        ];
        let refs = extract_refs(&articles);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_article_id, "a-1");
        assert_eq!(refs[0].target_article_number, "3");
        assert_eq!(refs[0].ref_type, "references");
    }

    #[test]
    fn self_references_are_skipped() {
        let articles = vec![prepared(
            "d1",
            "2",
            "Artikel 2 Loon\nHet loon uit artikel 2 geldt altijd.",
        )];
        assert!(extract_refs(&articles).is_empty());
    }

    #[test]
    fn duplicate_mentions_collapse_to_one_edge() {
        let articles = vec![
            prepared("d1", "1", "Zie artikel 2. Nogmaals: artikel 2. En artikel 2."),
            prepared("d1", "2", "Artikel 2\nInhoud."),
        ];
        let refs = extract_refs(&articles);
        assert_eq!(refs.len(), 1);
    }
}
