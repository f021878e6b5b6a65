//! Video identifier type.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum id length accepted for filesystem use.
const MAX_ID_LEN: usize = 64;

/// Errors produced when validating a video id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VideoIdError {
    #[error("video id is empty")]
    Empty,
    #[error("video id exceeds {MAX_ID_LEN} characters")]
    TooLong,
    #[error("video id contains non-alphanumeric character: {0:?}")]
    InvalidCharacter(char),
    #[error("video id does not start with the BV prefix: {0}")]
    MissingPrefix(String),
}

/// Stable identifier of a video on the remote service.
///
/// Treated as opaque by everything except [`VideoId::parse`], which enforces
/// the constraints that make the id safe to embed in filenames: ASCII
/// alphanumeric, bounded length, `BV` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    /// Validate and wrap a raw id string.
    pub fn parse(raw: impl Into<String>) -> Result<Self, VideoIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(VideoIdError::Empty);
        }
        if raw.len() > MAX_ID_LEN {
            return Err(VideoIdError::TooLong);
        }
        if let Some(c) = raw.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(VideoIdError::InvalidCharacter(c));
        }
        if !raw.starts_with("BV") {
            return Err(VideoIdError::MissingPrefix(raw));
        }
        Ok(Self(raw))
    }

    /// Wrap a string that is already known to be a valid id
    /// (e.g. one recovered from a dataset filename written by us).
    pub fn from_trusted(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filename stem of this id's metadata file.
    pub fn metadata_filename(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Filename of this id's media file for the given container extension.
    pub fn media_filename(&self, ext: &str) -> String {
        format!("{}.{}", self.0, ext)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VideoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
