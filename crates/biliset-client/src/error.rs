//! Client error types.

use std::time::Duration;

use biliset_models::ErrorKind;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the transport, session manager and API wrappers.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network unavailable: all probe hosts unreachable")]
    NetworkUnavailable,

    #[error("session expired or unauthorized")]
    AuthExpired,

    #[error("rate limited by remote, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("item not found on remote")]
    NotFound,

    #[error("no interactive authenticator configured and stored credential rejected")]
    NoAuthenticator,

    #[error("invalid response shape: {0}")]
    InvalidResponse(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Whether the transport retry loop may re-issue the request.
    ///
    /// `AuthExpired` is deliberately not retryable here: the session
    /// manager owns re-authentication and the caller re-issues.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transient(_) | ClientError::RateLimited { .. }
        )
    }

    /// Server-requested delay, when one was supplied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classification used by the run-level error aggregator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NetworkUnavailable => ErrorKind::NetworkUnavailable,
            ClientError::AuthExpired | ClientError::NoAuthenticator => ErrorKind::AuthExpired,
            ClientError::RateLimited { .. } => ErrorKind::RateLimited,
            ClientError::Transient(_) => ErrorKind::Transient,
            ClientError::Remote { .. } => ErrorKind::RemoteError,
            ClientError::NotFound => ErrorKind::NotFound,
            ClientError::InvalidResponse(_) => ErrorKind::RemoteError,
            ClientError::Io(_) | ClientError::Json(_) => ErrorKind::PerItemFailed,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            ClientError::Transient(e.to_string())
        } else if e.is_decode() {
            ClientError::InvalidResponse(e.to_string())
        } else {
            ClientError::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ClientError::transient("boom").is_retryable());
        assert!(ClientError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ClientError::AuthExpired.is_retryable());
        assert!(!ClientError::NotFound.is_retryable());
        assert!(!ClientError::remote(500, "oops").is_retryable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ClientError::AuthExpired.kind(),
            biliset_models::ErrorKind::AuthExpired
        );
        assert_eq!(
            ClientError::NotFound.kind(),
            biliset_models::ErrorKind::NotFound
        );
        assert_eq!(
            ClientError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
            .retry_after(),
            Some(Duration::from_secs(2))
        );
    }
}
