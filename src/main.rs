//! # Accord Index CLI (`acx`)
//!
//! The `acx` binary drives the full pipeline: database initialization,
//! document registration, batch processing, embedding backfill, index
//! reconciliation, retrieval, and the HTTP API.
//!
//! ```bash
//! acx init                          # create database
//! acx ingest ./documents            # register agreement files
//! acx process --workers 4           # run the batch pipeline
//! acx status <id>                   # per-document status
//! acx search "overtime compensation rate"
//! acx embed pending                 # backfill deferred embeddings
//! acx reindex                       # rebuild the derived index
//! acx serve                         # start the JSON API
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use accord_index::config;
use accord_index::db;
use accord_index::embedding;
use accord_index::ingest;
use accord_index::migrate;
use accord_index::monitor::{MemoryThresholds, ResourceMonitor};
use accord_index::orchestrator::{run_batch, PipelineContext};
use accord_index::progress::ProgressMode;
use accord_index::reasoning;
use accord_index::search;
use accord_index::server;
use accord_index::status;
use accord_index::store;
use accord_index::backfill;

/// Accord Index: ingestion, semantic indexing, and retrieval for
/// collective labor agreement documents.
#[derive(Parser)]
#[command(
    name = "acx",
    about = "Accord Index — ingestion, semantic indexing, and retrieval for labor agreements",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/acx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Register a document file or a directory of documents.
    ///
    /// Registered documents start `pending`; run `acx process` to parse
    /// and index them.
    Ingest {
        /// File or directory to register.
        path: PathBuf,

        /// Display name (defaults to a cleaned-up file name).
        #[arg(long)]
        name: Option<String>,

        /// Source label stored with the document.
        #[arg(long, default_value = "upload")]
        source: String,
    },

    /// Run the batch pipeline over all pending and retriable documents.
    Process {
        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,

        /// Maximum number of documents to claim this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Show the queue without processing anything.
        #[arg(long)]
        dry_run: bool,

        /// Progress output: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Show corpus stats, or one document's status with counts.
    Status {
        /// Document id. Without it, corpus-wide stats are shown.
        id: Option<String>,
    },

    /// Similarity search with ranked, cited results.
    Search {
        /// The query text.
        query: String,

        /// Comma-separated document ids to restrict the search to.
        #[arg(long)]
        documents: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Minimum similarity score in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,

        /// Token budget for the assembled context.
        #[arg(long)]
        context_tokens: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Rebuild the derived graph/vector index from relational rows.
    Reindex {
        /// Document id. Without it, every parsed document is reindexed.
        id: Option<String>,
    },

    /// Delete a document's articles, chunks, and index entries, then
    /// requeue it for reprocessing.
    Reset {
        /// Document id.
        id: String,
    },

    /// Start the HTTP JSON API.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that were persisted without a vector.
    Pending {
        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, name, source } => {
            let pool = db::connect(&cfg).await?;
            let ids = ingest::register_path(&pool, &cfg, &path, name, &source).await?;
            println!("ingest {}", path.display());
            println!("  registered: {} documents", ids.len());
            for id in &ids {
                println!("  {}", id);
            }
            println!("ok");
            pool.close().await;
        }
        Commands::Process {
            workers,
            limit,
            dry_run,
            progress,
        } => {
            let mut cfg = cfg;
            if workers.is_some() {
                cfg.orchestrator.workers = workers;
            }
            let pool = db::connect(&cfg).await?;

            if dry_run {
                let queue = store::load_queue(&pool, cfg.orchestrator.max_attempts, limit).await?;
                println!("process (dry-run)");
                println!("  queued documents: {}", queue.len());
                for doc in &queue {
                    println!("  {}  {} (attempts: {})", doc.id, doc.name, doc.attempts);
                }
                pool.close().await;
                return Ok(());
            }

            let mode = match progress.as_str() {
                "off" => ProgressMode::Off,
                "human" => ProgressMode::Human,
                "json" => ProgressMode::Json,
                _ => ProgressMode::default_for_tty(),
            };

            let monitor = Arc::new(ResourceMonitor::new(MemoryThresholds {
                soft_pct: cfg.orchestrator.memory_soft_pct,
                hard_pct: cfg.orchestrator.memory_hard_pct,
            }));
            let proposer = reasoning::create_proposer(&cfg.reasoning)?;
            let embedder = embedding::create_embedder(&cfg.embedding)?;

            let context = Arc::new(PipelineContext {
                pool: pool.clone(),
                config: cfg,
                proposer,
                embedder,
                monitor,
                reporter: Arc::from(mode.reporter()),
            });

            // Cancellation: ctrl-c lets in-flight documents finish their
            // transaction cleanly, remaining queued documents stay pending.
            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            });

            let summary = run_batch(context, cancel_rx, limit).await?;

            println!("process");
            println!("  parsed: {}", summary.parsed);
            println!("  failed: {}", summary.failed);
            println!("  requeued: {}", summary.requeued);
            if summary.skipped > 0 {
                println!("  skipped (cancelled): {}", summary.skipped);
            }
            println!("ok");
            pool.close().await;
        }
        Commands::Status { id } => {
            let pool = db::connect(&cfg).await?;
            match id {
                Some(id) => match status::document_status(&pool, &cfg, &id).await? {
                    Some(report) => status::print_document_status(&report),
                    None => println!("No document with id {}", id),
                },
                None => status::run_stats(&pool, &cfg).await?,
            }
            pool.close().await;
        }
        Commands::Search {
            query,
            documents,
            top_k,
            threshold,
            context_tokens,
        } => {
            let pool = db::connect(&cfg).await?;
            search::run_search(
                &cfg,
                &pool,
                &query,
                documents,
                top_k,
                threshold,
                context_tokens,
            )
            .await?;
            pool.close().await;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => {
                let pool = db::connect(&cfg).await?;
                backfill::run_backfill(&cfg, &pool, limit).await?;
                pool.close().await;
            }
        },
        Commands::Reindex { id } => {
            let pool = db::connect(&cfg).await?;
            match id {
                Some(id) => {
                    if store::get_document(&pool, &id).await?.is_none() {
                        println!("No document with id {}", id);
                        pool.close().await;
                        return Ok(());
                    }
                    store::rebuild_index(&pool, &id).await?;
                    println!("reindex {}", id);
                }
                None => {
                    let count = store::rebuild_all(&pool).await?;
                    println!("reindex");
                    println!("  documents reindexed: {}", count);
                }
            }
            println!("ok");
            pool.close().await;
        }
        Commands::Reset { id } => {
            let pool = db::connect(&cfg).await?;
            let Some(document) = store::get_document(&pool, &id).await? else {
                println!("No document with id {}", id);
                pool.close().await;
                return Ok(());
            };
            store::reset_document(&pool, &id).await?;
            println!("reset {} — {}", id, document.name);
            println!("  document requeued for processing");
            println!("ok");
            pool.close().await;
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            server::run_server(&cfg, pool).await?;
        }
    }

    Ok(())
}
