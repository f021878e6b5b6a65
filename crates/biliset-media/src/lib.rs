//! Media acquisition for the biliset crawler.
//!
//! Downloads the video and audio streams of an item with byte-range
//! resumption, muxes them into a single container via an external
//! FFmpeg-compatible tool, and guards disk usage.

pub mod disk;
pub mod downloader;
pub mod error;
pub mod fs_utils;
pub mod mux;
pub mod probe;

pub use downloader::{DownloadConfig, DownloadOutcome, StreamDownloader};
pub use error::{MediaError, MediaResult};
pub use mux::MuxCommand;
pub use probe::probe_duration;
