//! Store error types.

use biliset_models::{ErrorKind, VideoId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the dataset store and maintenance engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("[{0}] no metadata record committed; media cannot be attached")]
    MetadataMissing(VideoId),

    #[error("index write failed, in-memory state rolled back: {0}")]
    CommitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed(message.into())
    }

    /// Classification used by the run-level error aggregator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::CommitFailed(_) => ErrorKind::CommitFailed,
            _ => ErrorKind::PerItemFailed,
        }
    }
}
