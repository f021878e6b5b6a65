//! Crawler pipeline: search, metadata collection and orchestration.

pub mod breaker;
pub mod collector;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod search;

pub use config::{CrawlerConfig, RunMode, SearchConfig, StoreConfig};
pub use error::{CrawlerError, CrawlerResult};
pub use pipeline::Pipeline;
