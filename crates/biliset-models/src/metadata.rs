//! Persisted per-video metadata records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::VideoId;

/// Current schema version written into new records.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Core descriptive fields of a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicInfo {
    pub bvid: VideoId,
    /// Numeric alternate id of the item on the remote service.
    #[serde(default)]
    pub aid: u64,
    pub title: String,
    #[serde(default)]
    pub desc: String,
    /// Duration in seconds.
    pub duration: u64,
    /// Publish time as a unix timestamp (seconds).
    pub pubdate: i64,
    /// Cover image URL.
    #[serde(default)]
    pub pic: String,
}

/// Uploader identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Owner {
    pub mid: i64,
    pub name: String,
    #[serde(default)]
    pub face: String,
}

/// Engagement counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatCounts {
    #[serde(default)]
    pub view: u64,
    #[serde(default)]
    pub danmaku: u64,
    #[serde(default)]
    pub reply: u64,
    #[serde(default)]
    pub favorite: u64,
    #[serde(default)]
    pub coin: u64,
    #[serde(default)]
    pub share: u64,
    #[serde(default)]
    pub like: u64,
}

/// One segment of a multi-segment video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Internal segment identifier used by the stream endpoints.
    pub cid: u64,
    /// 1-based position.
    pub page: u32,
    /// Segment title.
    #[serde(default)]
    pub part: String,
    /// Segment duration in seconds.
    #[serde(default)]
    pub duration: u64,
}

/// Provenance of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlInfo {
    /// When the record was composed.
    pub crawled_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// The persisted metadata document, one per video.
///
/// Written pretty-printed to `metadata/<id>.json`; re-crawling the same id
/// overwrites the file and its index entry in one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub basic_info: BasicInfo,
    pub owner: Owner,
    pub stat: StatCounts,
    #[serde(default)]
    pub pages: Vec<PageInfo>,
    /// Tag names only; tag ids are not retained.
    #[serde(default)]
    pub tags: Vec<String>,
    pub crawl_info: CrawlInfo,
}

impl MetadataRecord {
    pub fn id(&self) -> &VideoId {
        &self.basic_info.bvid
    }

    pub fn duration(&self) -> u64 {
        self.basic_info.duration
    }

    /// Validate that the record carries the fields every downstream
    /// consumer depends on. Trims title/description in place.
    pub fn normalize(&mut self) -> Result<(), MetadataValidationError> {
        self.basic_info.title = self.basic_info.title.trim().to_string();
        self.basic_info.desc = self.basic_info.desc.trim().to_string();
        self.owner.name = self.owner.name.trim().to_string();
        for tag in &mut self.tags {
            *tag = tag.trim().to_string();
        }
        if self.basic_info.title.is_empty() {
            return Err(MetadataValidationError::MissingTitle(
                self.basic_info.bvid.clone(),
            ));
        }
        if self.basic_info.duration == 0 {
            return Err(MetadataValidationError::MissingDuration(
                self.basic_info.bvid.clone(),
            ));
        }
        if self.owner.mid == 0 {
            return Err(MetadataValidationError::MissingOwner(
                self.basic_info.bvid.clone(),
            ));
        }
        Ok(())
    }

    /// Field-wise equality ignoring crawl provenance, for idempotence checks.
    pub fn same_content(&self, other: &MetadataRecord) -> bool {
        self.basic_info == other.basic_info
            && self.owner == other.owner
            && self.stat == other.stat
            && self.pages == other.pages
            && self.tags == other.tags
    }
}

/// A record failed required-field validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataValidationError {
    #[error("[{0}] record has no title")]
    MissingTitle(VideoId),
    #[error("[{0}] record has no duration")]
    MissingDuration(VideoId),
    #[error("[{0}] record has no owner id")]
    MissingOwner(VideoId),
}
