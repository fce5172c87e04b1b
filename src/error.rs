use thiserror::Error;

/// Errors surfaced by the import pipeline.
#[derive(Debug, Error)]
pub enum ImportError {
    /// TaskRunner backpressure: the submission queue is at capacity.
    #[error("task queue is full ({queued} queued, limit {limit})")]
    QueueFull { queued: usize, limit: usize },

    /// A batch write failed after the retry budget was exhausted. The
    /// entries it carried have been dropped and counted.
    #[error("batch flush failed after {attempts} attempts ({entries} entries dropped): {reason}")]
    Flush {
        attempts: u32,
        entries: usize,
        reason: String,
    },

    /// Doc map lookup/insert failed against the backing store.
    #[error("resolution failed for '{external_id}': {source}")]
    Resolution {
        external_id: String,
        #[source]
        source: StoreError,
    },

    /// The run terminated early: source read failure or an unrecoverable
    /// resolution failure. Counters collected so far remain valid.
    #[error("import run aborted: {reason}")]
    RunAborted { reason: String },
}

/// Errors raised by backing stores and external collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        StoreError::Backend(msg.into())
    }
}
