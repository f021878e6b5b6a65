//! Run and maintenance reports.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::VideoId;

/// Classification of failures, aggregated into the run report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkUnavailable,
    AuthExpired,
    RateLimited,
    Transient,
    RemoteError,
    NotFound,
    QualityUnavailable,
    DiskFull,
    MergeError,
    CommitFailed,
    SearchFailed,
    /// A per-item failure after retry exhaustion; the run continues.
    PerItemFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::RemoteError => "remote_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::QualityUnavailable => "quality_unavailable",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::MergeError => "merge_error",
            ErrorKind::CommitFailed => "commit_failed",
            ErrorKind::SearchFailed => "search_failed",
            ErrorKind::PerItemFailed => "per_item_failed",
        };
        write!(f, "{name}")
    }
}

/// Aggregate outcome of one crawl run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub keywords_processed: u64,
    pub candidates_seen: u64,
    pub metadata_committed: u64,
    pub downloads_committed: u64,
    pub downloads_skipped_by_duration: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

impl RunReport {
    pub fn record_error(&mut self, kind: ErrorKind) {
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_by_kind.values().sum()
    }

    /// Merge counters from another report (used to fold worker-local
    /// reports into the run-level one).
    pub fn merge(&mut self, other: &RunReport) {
        self.keywords_processed += other.keywords_processed;
        self.candidates_seen += other.candidates_seen;
        self.metadata_committed += other.metadata_committed;
        self.downloads_committed += other.downloads_committed;
        self.downloads_skipped_by_duration += other.downloads_skipped_by_duration;
        for (kind, count) in &other.errors_by_kind {
            *self.errors_by_kind.entry(*kind).or_insert(0) += count;
        }
    }
}

/// Outcome of `remove` on the dataset store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    /// Ids whose index entry was removed.
    pub removed: Vec<VideoId>,
    /// Ids that had no metadata file on disk.
    pub missing_metadata: Vec<VideoId>,
    /// Ids that had no media file on disk.
    pub missing_media: Vec<VideoId>,
    /// Bytes freed by deleted files.
    pub bytes_freed: u64,
}

/// A removal the duration filter intends to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRemoval {
    pub id: VideoId,
    pub duration: u64,
}

/// Outcome of the duration-based maintenance filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterReport {
    pub dry_run: bool,
    /// Metadata records examined.
    pub scanned: u64,
    /// Items over the duration limit.
    pub planned: Vec<PlannedRemoval>,
    /// Items whose duration could not be determined; listed, never removed.
    pub undetermined: Vec<VideoId>,
    pub removed_metadata: u64,
    pub removed_media: u64,
    pub removed_entries: u64,
    pub bytes_freed: u64,
}

/// Outcome of orphan analysis over the dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    pub metadata_total: u64,
    pub media_total: u64,
    pub index_total: u64,
    pub matched_pairs: u64,
    /// Metadata file exists, media file does not.
    pub metadata_only: Vec<VideoId>,
    /// Media file exists, metadata file does not.
    pub media_only: Vec<VideoId>,
    /// Index entry exists, neither file does.
    pub index_only: Vec<VideoId>,
    /// Both files exist, index entry does not.
    pub missing_from_index: Vec<VideoId>,
}

/// Outcome of index reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub dry_run: bool,
    /// Entries dropped because their id is not a complete pair.
    pub removed: Vec<VideoId>,
    /// Entries added for complete pairs missing from the index.
    pub added: Vec<VideoId>,
}

impl SyncReport {
    pub fn removed_count(&self) -> u64 {
        self.removed.len() as u64
    }

    pub fn added_count(&self) -> u64 {
        self.added.len() as u64
    }

    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Outcome of orphan cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    pub dry_run: bool,
    pub cleaned_media: Vec<VideoId>,
    pub cleaned_metadata: Vec<VideoId>,
    /// Present when `update_index` was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_sync: Option<SyncReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }

    #[test]
    fn test_run_report_counts_and_merges() {
        let mut a = RunReport::default();
        a.record_error(ErrorKind::Transient);
        a.record_error(ErrorKind::Transient);
        a.metadata_committed = 3;

        let mut b = RunReport::default();
        b.record_error(ErrorKind::Transient);
        b.record_error(ErrorKind::MergeError);
        b.downloads_committed = 1;

        a.merge(&b);
        assert_eq!(a.error_count(ErrorKind::Transient), 3);
        assert_eq!(a.error_count(ErrorKind::MergeError), 1);
        assert_eq!(a.total_errors(), 4);
        assert_eq!(a.metadata_committed, 3);
        assert_eq!(a.downloads_committed, 1);
    }

    #[test]
    fn test_errors_by_kind_is_a_json_object() {
        let mut report = RunReport::default();
        report.record_error(ErrorKind::DiskFull);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["errors_by_kind"]["disk_full"], 1);
    }
}
