//! Batch progress reporting.
//!
//! Emits per-document pipeline events on **stderr** so stdout stays
//! parseable for scripts. Human output for TTYs, one JSON object per line
//! otherwise available for supervisors.

use std::io::Write;

/// A per-document event from the batch orchestrator.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    Claimed {
        document: String,
        name: String,
    },
    Parsed {
        document: String,
        articles: u64,
        chunks: u64,
        embedded: u64,
        deferred: u64,
        degraded: bool,
    },
    Requeued {
        document: String,
        reason: String,
    },
    Failed {
        document: String,
        reason: String,
    },
    ResourcePressure {
        used_mb: u64,
        total_mb: u64,
    },
}

/// Reports batch progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: BatchEvent);
}

/// Human-friendly progress lines.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: BatchEvent) {
        let line = match &event {
            BatchEvent::Claimed { document, name } => {
                format!("process {}  claimed  {}\n", short(document), name)
            }
            BatchEvent::Parsed {
                document,
                articles,
                chunks,
                embedded,
                deferred,
                degraded,
            } => {
                let flag = if *degraded { "  (degraded)" } else { "" };
                format!(
                    "process {}  parsed  {} articles, {} chunks, {} embedded, {} deferred{}\n",
                    short(document),
                    articles,
                    chunks,
                    embedded,
                    deferred,
                    flag
                )
            }
            BatchEvent::Requeued { document, reason } => {
                format!("process {}  requeued  {}\n", short(document), reason)
            }
            BatchEvent::Failed { document, reason } => {
                format!("process {}  failed  {}\n", short(document), reason)
            }
            BatchEvent::ResourcePressure { used_mb, total_mb } => {
                format!(
                    "process --  memory pressure  {} / {} MB\n",
                    used_mb, total_mb
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: BatchEvent) {
        let obj = match &event {
            BatchEvent::Claimed { document, name } => serde_json::json!({
                "event": "claimed", "document": document, "name": name,
            }),
            BatchEvent::Parsed {
                document,
                articles,
                chunks,
                embedded,
                deferred,
                degraded,
            } => serde_json::json!({
                "event": "parsed", "document": document, "articles": articles,
                "chunks": chunks, "embedded": embedded, "deferred": deferred,
                "degraded": degraded,
            }),
            BatchEvent::Requeued { document, reason } => serde_json::json!({
                "event": "requeued", "document": document, "reason": reason,
            }),
            BatchEvent::Failed { document, reason } => serde_json::json!({
                "event": "failed", "document": document, "reason": reason,
            }),
            BatchEvent::ResourcePressure { used_mb, total_mb } => serde_json::json!({
                "event": "resource_pressure", "used_mb": used_mb, "total_mb": total_mb,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: BatchEvent) {}
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
