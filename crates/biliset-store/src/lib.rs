//! Dataset storage for the biliset crawler.
//!
//! Owns the filesystem layout and the three-way invariant between metadata
//! files, media files and the index document. All mutations are commits:
//! artifact first, then the index, atomically persisted.

pub mod error;
pub mod layout;
pub mod maintenance;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use layout::{atomic_write_json, DatasetLayout};
pub use maintenance::MaintenanceEngine;
pub use store::{DatasetStore, PutOutcome};
