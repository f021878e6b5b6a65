//! Shared data models for the biliset dataset crawler.
//!
//! This crate provides Serde-serializable types for:
//! - Video identifiers and quality codes
//! - Search candidates (in-memory only)
//! - Persisted metadata records
//! - The dataset index document
//! - Run and maintenance reports

pub mod candidate;
pub mod id;
pub mod index;
pub mod metadata;
pub mod quality;
pub mod report;
pub mod utils;

// Re-export common types
pub use candidate::Candidate;
pub use id::{VideoId, VideoIdError};
pub use index::{IndexDocument, IndexEntry, IndexMeta, IndexStats};
pub use metadata::{
    BasicInfo, CrawlInfo, MetadataRecord, MetadataValidationError, Owner, PageInfo, StatCounts,
    METADATA_SCHEMA_VERSION,
};
pub use quality::Quality;
pub use report::{
    CleanReport, ErrorKind, FilterReport, MatchReport, PlannedRemoval, RemovalReport, RunReport,
    SyncReport,
};
pub use utils::parse_duration_text;
