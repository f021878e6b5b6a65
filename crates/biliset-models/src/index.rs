//! The dataset index document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::VideoId;
use crate::metadata::MetadataRecord;

/// Projection of a metadata record kept in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub bvid: VideoId,
    pub title: String,
    /// Duration in seconds; must equal the metadata file's duration.
    pub duration: u64,
    pub pubdate: i64,
    pub owner_name: String,
    #[serde(default)]
    pub view: u64,
    #[serde(default)]
    pub like: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Set by `attach_media` once the muxed artifact exists.
    #[serde(default)]
    pub has_media: bool,
    /// Container extension of the media artifact, when attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ext: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Build the index projection of a metadata record.
    pub fn from_record(record: &MetadataRecord) -> Self {
        Self {
            bvid: record.basic_info.bvid.clone(),
            title: record.basic_info.title.clone(),
            duration: record.basic_info.duration,
            pubdate: record.basic_info.pubdate,
            owner_name: record.owner.name.clone(),
            view: record.stat.view,
            like: record.stat.like,
            tags: record.tags.clone(),
            has_media: false,
            media_ext: None,
            indexed_at: Utc::now(),
        }
    }
}

/// Aggregate statistics, recomputed on every index write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_count: u64,
    /// Sum of entry durations in seconds.
    pub total_duration: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for IndexStats {
    fn default() -> Self {
        Self {
            total_count: 0,
            total_duration: 0,
            last_updated: Utc::now(),
        }
    }
}

/// Dataset-level descriptive block, preserved across rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub dataset_name: String,
    pub created_at: DateTime<Utc>,
    /// Unknown fields from older or newer writers, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            dataset_name: "biliset".to_string(),
            created_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }
}

/// The process-wide index of persisted items.
///
/// Mutations go through [`IndexDocument::upsert`] / [`IndexDocument::remove`]
/// so that `stats` can never drift from `videos`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexDocument {
    #[serde(default)]
    pub metadata: IndexMeta,
    #[serde(default)]
    pub videos: BTreeMap<VideoId, IndexEntry>,
    #[serde(default)]
    pub stats: IndexStats,
    /// Top-level fields this writer does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl IndexDocument {
    pub fn new(dataset_name: impl Into<String>) -> Self {
        Self {
            metadata: IndexMeta {
                dataset_name: dataset_name.into(),
                created_at: Utc::now(),
                extra: BTreeMap::new(),
            },
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn contains(&self, id: &VideoId) -> bool {
        self.videos.contains_key(id)
    }

    pub fn get(&self, id: &VideoId) -> Option<&IndexEntry> {
        self.videos.get(id)
    }

    /// Insert or replace an entry and refresh the stats.
    /// Returns true when the id was not present before.
    pub fn upsert(&mut self, entry: IndexEntry) -> bool {
        let created = self
            .videos
            .insert(entry.bvid.clone(), entry)
            .is_none();
        self.recompute_stats();
        created
    }

    /// Remove an entry and refresh the stats. Returns the removed entry.
    pub fn remove(&mut self, id: &VideoId) -> Option<IndexEntry> {
        let removed = self.videos.remove(id);
        if removed.is_some() {
            self.recompute_stats();
        }
        removed
    }

    /// Recompute `stats` from `videos` and stamp the update time.
    pub fn recompute_stats(&mut self) {
        self.stats.total_count = self.videos.len() as u64;
        self.stats.total_duration = self.videos.values().map(|e| e.duration).sum();
        self.stats.last_updated = Utc::now();
    }
}
