//! Pipeline error taxonomy.
//!
//! Per-document errors are isolated by the orchestrator: they mark that
//! document failed (or requeue it) and the batch continues. Only
//! [`PipelineError::Connection`] (loss of the authoritative relational
//! store) aborts a whole run.

use thiserror::Error;

use crate::extract::ExtractError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Document bytes could not be turned into text. Fatal for the document.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    /// Relational write failed. Fatal for the document; the transaction has
    /// already been rolled back.
    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    /// The relational store itself is unreachable. Aborts the whole run.
    #[error("relational store unreachable: {0}")]
    Connection(String),

    /// Memory threshold breached while a document was in flight. The
    /// document is requeued; nothing partial was committed.
    #[error("memory threshold exceeded: {used_mb} MB used of {total_mb} MB")]
    ResourceExhaustion { used_mb: u64, total_mb: u64 },

    /// No forward progress within the per-document time budget. Requeued.
    #[error("document stalled: no completion within {0}s")]
    Stalled(u64),

    /// The batch run was cancelled; the document stays queued.
    #[error("batch run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Errors that leave the document retriable (requeue, attempts + 1)
    /// instead of terminally failed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PipelineError::ResourceExhaustion { .. }
                | PipelineError::Stalled(_)
                | PipelineError::Cancelled
        )
    }

    /// True when the error means the run as a whole cannot continue.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, PipelineError::Connection(_))
    }
}

/// Classify an sqlx error: connectivity loss is fatal for the run, anything
/// else is a document-scoped storage failure.
pub fn storage_error(err: sqlx::Error) -> PipelineError {
    match &err {
        sqlx::Error::Io(e) => PipelineError::Connection(e.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            PipelineError::Connection(err.to_string())
        }
        _ => PipelineError::Storage(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(PipelineError::Stalled(600).is_retriable());
        assert!(PipelineError::ResourceExhaustion {
            used_mb: 7000,
            total_mb: 8000
        }
        .is_retriable());
        assert!(!PipelineError::Connection("refused".into()).is_retriable());
        assert!(!PipelineError::Extraction(ExtractError::Empty).is_retriable());
    }

    #[test]
    fn connection_is_fatal_for_run() {
        assert!(PipelineError::Connection("gone".into()).is_fatal_for_run());
        assert!(!PipelineError::Stalled(1).is_fatal_for_run());
    }

    #[test]
    fn pool_errors_map_to_connection() {
        let err = storage_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, PipelineError::Connection(_)));
    }
}
