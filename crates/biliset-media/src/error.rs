//! Error types for media operations.

use biliset_client::ClientError;
use biliset_models::ErrorKind;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while acquiring media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("muxer tool not found: {0}")]
    MuxerNotFound(String),

    #[error("ffprobe not found in PATH")]
    FfprobeNotFound,

    #[error("mux failed (tool {tool}, exit code {exit_code:?}): {stderr_tail}")]
    MergeFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("media probe failed: {0}")]
    ProbeFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("downloaded length {actual} does not match advertised length {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("insufficient disk capacity: required {required} bytes, available {available}")]
    DiskFull { required: u64, available: u64 },

    #[error("no stream representations available for item")]
    NoStreams,

    #[error("operation cancelled")]
    Cancelled,

    #[error("external tool timed out after {0} seconds")]
    Timeout(u64),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MediaError {
    pub fn download_failed(message: impl Into<String>) -> Self {
        Self::DownloadFailed(message.into())
    }

    pub fn probe_failed(message: impl Into<String>) -> Self {
        Self::ProbeFailed(message.into())
    }

    /// Whether another download attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MediaError::LengthMismatch { .. } | MediaError::DownloadFailed(_) => true,
            MediaError::Client(e) => e.is_retryable(),
            MediaError::Io(_) => true,
            _ => false,
        }
    }

    /// Classification used by the run-level error aggregator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::MergeFailed { .. }
            | MediaError::MuxerNotFound(_)
            | MediaError::Timeout(_) => ErrorKind::MergeError,
            MediaError::DiskFull { .. } => ErrorKind::DiskFull,
            MediaError::NoStreams => ErrorKind::QualityUnavailable,
            MediaError::Client(e) => e.kind(),
            _ => ErrorKind::PerItemFailed,
        }
    }
}
