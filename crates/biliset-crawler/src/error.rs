//! Crawler error types.

use biliset_client::ClientError;
use biliset_media::MediaError;
use biliset_models::{ErrorKind, MetadataValidationError};
use biliset_store::StoreError;
use thiserror::Error;

/// Result type for crawler operations.
pub type CrawlerResult<T> = Result<T, CrawlerError>;

/// Errors surfaced by the pipeline stages.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("search failed for keyword {keyword:?}: every page request failed")]
    SearchFailed { keyword: String },

    #[error("remote error rate tripped the circuit breaker, stage halted")]
    CircuitOpen,

    #[error(transparent)]
    Invalid(#[from] MetadataValidationError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CrawlerError {
    /// Classification used by the run-level error aggregator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlerError::SearchFailed { .. } => ErrorKind::SearchFailed,
            CrawlerError::CircuitOpen => ErrorKind::RemoteError,
            CrawlerError::Invalid(_) => ErrorKind::PerItemFailed,
            CrawlerError::Client(e) => e.kind(),
            CrawlerError::Media(e) => e.kind(),
            CrawlerError::Store(e) => e.kind(),
        }
    }

    /// Run-level failures abort the whole run; everything else is
    /// degraded to a per-item outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlerError::Client(ClientError::NetworkUnavailable)
                | CrawlerError::Client(ClientError::NoAuthenticator)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passthrough() {
        let e = CrawlerError::from(ClientError::NotFound);
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e = CrawlerError::SearchFailed {
            keyword: "kw".to_string(),
        };
        assert_eq!(e.kind(), ErrorKind::SearchFailed);
    }

    #[test]
    fn test_fatality() {
        assert!(CrawlerError::from(ClientError::NetworkUnavailable).is_fatal());
        assert!(!CrawlerError::from(ClientError::NotFound).is_fatal());
        assert!(!CrawlerError::CircuitOpen.is_fatal());
    }
}
