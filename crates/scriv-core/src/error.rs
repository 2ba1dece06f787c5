//! Error taxonomy for the reconciliation core.
//!
//! Repair failures, pairing violations, oversized histories, and stale
//! writes are all absorbed inside the core (recorded, healed, trimmed, or
//! skipped). Only the two variants of [`TurnError`] terminate a turn and
//! propagate upward as its end-of-stream status.

/// Terminating classifications for a turn. Both trigger the same
/// best-effort partial-save path; they differ only in recorded reason.
#[derive(thiserror::Error, Debug)]
pub enum TurnError {
    #[error("upstream disconnected: {0}")]
    Disconnected(String),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl TurnError {
    /// Short tag stored with a partially flushed message.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            TurnError::Disconnected(_) => "interrupted",
            TurnError::Unexpected(_) => "unexpected_error",
        }
    }
}

/// Document store errors. `Conflict` is absorbed by the writer's
/// read-decide-write retry loop; the rest surface as `Unexpected`.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Transcript sink errors.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("transcript backend error: {0}")]
    Backend(String),
}
