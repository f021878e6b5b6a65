//! Crawler configuration.
//!
//! The front-end that loads and merges configuration files is out of scope
//! here; this module defines the immutable configuration record the core
//! consumes, with defaults and an environment-variable overlay.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

use biliset_client::{SessionConfig, TransportConfig};
use biliset_media::DownloadConfig;
use biliset_models::Quality;

/// What a process invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// The full network pipeline: search, collect, download.
    #[default]
    Crawl,
    /// Offline orphan analysis (read-only).
    Analyze,
    /// Offline index reconciliation.
    SyncIndex,
    /// Offline orphan cleaning.
    Clean,
    /// Offline duration-based filtering.
    FilterDuration,
}

impl RunMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "crawl" => Some(RunMode::Crawl),
            "analyze" => Some(RunMode::Analyze),
            "sync-index" => Some(RunMode::SyncIndex),
            "clean" => Some(RunMode::Clean),
            "filter-duration" => Some(RunMode::FilterDuration),
            _ => None,
        }
    }
}

/// Optional engagement-score filter applied during search.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityThreshold {
    pub threshold: f64,
    pub w_like: f64,
    pub w_coin: f64,
    pub w_fav: f64,
}

/// Search stage configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub page_size: u32,
    pub max_pages: u32,
    /// Remote ordering key for search results.
    pub order: String,
    /// Uniformly sampled sleep between page requests.
    pub page_interval: (Duration, Duration),
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub min_view_count: u64,
    pub min_pubdate: Option<NaiveDate>,
    pub max_pubdate: Option<NaiveDate>,
    /// Title must contain at least one of these (case-insensitive).
    pub keyword_filters: Vec<String>,
    /// Title must contain none of these (case-insensitive).
    pub keyword_excludes: Vec<String>,
    /// Off by default.
    pub quality_threshold: Option<QualityThreshold>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            max_pages: 50,
            order: "totalrank".to_string(),
            page_interval: (Duration::from_millis(1000), Duration::from_millis(2500)),
            min_duration: None,
            max_duration: None,
            min_view_count: 0,
            min_pubdate: None,
            max_pubdate: None,
            keyword_filters: Vec::new(),
            keyword_excludes: Vec::new(),
            quality_threshold: None,
        }
    }
}

impl SearchConfig {
    /// Publish-time window as unix timestamps, closed on both ends.
    pub fn pubdate_bounds(&self) -> (Option<i64>, Option<i64>) {
        let start = self
            .min_pubdate
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp());
        let end = self
            .max_pubdate
            .and_then(|d| d.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc().timestamp());
        (start, end)
    }
}

/// Dataset store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub metadata_dir: PathBuf,
    pub media_dir: PathBuf,
    pub index_file: PathBuf,
    pub update_index_on_save: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("data/metadata"),
            media_dir: PathBuf::from("data/media"),
            index_file: PathBuf::from("data/metadata/index.json"),
            update_index_on_save: true,
        }
    }
}

/// The complete immutable configuration record.
#[derive(Debug, Clone, Default)]
pub struct CrawlerConfig {
    pub mode: RunMode,
    pub keywords: Vec<String>,
    /// Per-keyword candidate cap.
    pub limit_per_keyword: u64,
    /// Global cap on committed items, applied by the orchestrator.
    pub max_items: Option<u64>,
    /// Fetch media artifacts (false = metadata only).
    pub download: bool,
    /// Skip items already present as complete pairs.
    pub resume: bool,
    pub metadata_workers: usize,
    /// Process-wide concurrent download cap.
    pub concurrent_limit: usize,
    /// Pre-download duration filter; `None` disables it.
    pub max_duration_on_download: Option<u64>,
    /// Threshold for maintenance duration filtering.
    pub filter_max_duration: u64,
    /// Maintenance dry-run toggle.
    pub dry_run: bool,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub search: SearchConfig,
    pub downloader: DownloadConfig,
    pub store: StoreConfig,
}

impl CrawlerConfig {
    /// Defaults with an environment-variable overlay (`BILISET_*`).
    pub fn from_env() -> Self {
        let mut config = Self {
            mode: env_str("BILISET_MODE")
                .and_then(|m| RunMode::from_name(&m))
                .unwrap_or_default(),
            keywords: env_str("BILISET_KEYWORDS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            limit_per_keyword: env_parse("BILISET_LIMIT_PER_KEYWORD").unwrap_or(100),
            max_items: env_parse("BILISET_MAX_ITEMS"),
            download: env_parse("BILISET_DOWNLOAD").unwrap_or(true),
            resume: env_parse("BILISET_RESUME").unwrap_or(true),
            metadata_workers: env_parse("BILISET_METADATA_WORKERS").unwrap_or(2),
            concurrent_limit: env_parse("BILISET_CONCURRENT_LIMIT").unwrap_or(3),
            // Zero or negative means unset.
            max_duration_on_download: env_parse::<i64>("BILISET_MAX_DURATION_ON_DOWNLOAD")
                .filter(|&v| v > 0)
                .map(|v| v as u64),
            filter_max_duration: env_parse("BILISET_FILTER_MAX_DURATION").unwrap_or(30),
            dry_run: env_parse("BILISET_DRY_RUN").unwrap_or(false),
            ..Default::default()
        };

        config.transport = TransportConfig {
            request_interval: env_duration_ms("BILISET_REQUEST_INTERVAL_MS")
                .unwrap_or(Duration::from_millis(1500)),
            random_offset: env_duration_ms("BILISET_RANDOM_OFFSET_MS")
                .unwrap_or(Duration::from_millis(500)),
            max_retries: env_parse("BILISET_MAX_RETRIES").unwrap_or(3),
            retry_base_interval: env_duration_ms("BILISET_RETRY_BASE_MS")
                .unwrap_or(Duration::from_secs(2)),
            timeout: Duration::from_secs(env_parse("BILISET_TIMEOUT_SECS").unwrap_or(30)),
            ..Default::default()
        };

        if let Some(agents) = env_str("BILISET_USER_AGENTS") {
            let agents: Vec<String> = agents
                .split('|')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            if !agents.is_empty() {
                config.transport.user_agents = agents;
            }
        }
        if let Some(secs) = env_parse("BILISET_UA_ROTATE_SECS") {
            config.transport.ua_rotate_interval = Duration::from_secs(secs);
        }
        config.transport.ua_rotate_requests = env_parse("BILISET_UA_ROTATE_REQUESTS");

        config.session = SessionConfig {
            credential_file: env_str("BILISET_CREDENTIAL_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/credential.json")),
            check_network: env_parse("BILISET_CHECK_NETWORK").unwrap_or(true),
            ..Default::default()
        };

        config.search = SearchConfig {
            page_size: env_parse("BILISET_PAGE_SIZE").unwrap_or(30),
            max_pages: env_parse("BILISET_MAX_PAGES").unwrap_or(50),
            min_view_count: env_parse("BILISET_MIN_VIEW_COUNT").unwrap_or(0),
            min_duration: env_parse("BILISET_MIN_DURATION"),
            max_duration: env_parse("BILISET_MAX_DURATION"),
            min_pubdate: env_date("BILISET_MIN_PUBDATE"),
            max_pubdate: env_date("BILISET_MAX_PUBDATE"),
            keyword_filters: env_list("BILISET_KEYWORD_FILTERS"),
            keyword_excludes: env_list("BILISET_KEYWORD_EXCLUDES"),
            ..Default::default()
        };
        if let (Some(lo), Some(hi)) = (
            env_parse::<u64>("BILISET_PAGE_INTERVAL_LO_MS"),
            env_parse::<u64>("BILISET_PAGE_INTERVAL_HI_MS"),
        ) {
            config.search.page_interval =
                (Duration::from_millis(lo), Duration::from_millis(hi.max(lo)));
        }
        if let Some(threshold) = env_parse::<f64>("BILISET_QUALITY_THRESHOLD") {
            config.search.quality_threshold = Some(QualityThreshold {
                threshold,
                w_like: env_parse("BILISET_QUALITY_W_LIKE").unwrap_or(1.0),
                w_coin: env_parse("BILISET_QUALITY_W_COIN").unwrap_or(0.0),
                w_fav: env_parse("BILISET_QUALITY_W_FAV").unwrap_or(0.0),
            });
        }

        let data_root = env_str("BILISET_DATA_DIR").unwrap_or_else(|| "data".to_string());
        let metadata_dir = env_str("BILISET_METADATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&data_root).join("metadata"));
        let media_dir = env_str("BILISET_MEDIA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&data_root).join("media"));
        config.store = StoreConfig {
            index_file: env_str("BILISET_INDEX_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| metadata_dir.join("index.json")),
            metadata_dir,
            media_dir: media_dir.clone(),
            update_index_on_save: env_parse("BILISET_UPDATE_INDEX_ON_SAVE").unwrap_or(true),
        };

        config.downloader = DownloadConfig {
            media_dir,
            requested_quality: env_parse::<u32>("BILISET_QUALITY")
                .and_then(Quality::from_code)
                .unwrap_or_default(),
            retry_times: env_parse("BILISET_RETRY_TIMES").unwrap_or(5),
            chunk_size: env_parse("BILISET_CHUNK_SIZE").unwrap_or(1024 * 1024),
            max_size_gb: env_parse("BILISET_MAX_SIZE_GB"),
            muxer_tool: env_str("BILISET_MUXER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ffmpeg")),
            ..Default::default()
        };

        config
    }

    /// Bounded-channel capacity between pipeline stages.
    pub fn channel_capacity(&self) -> usize {
        (self.search.page_size as usize).saturating_mul(2).max(4)
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.trim().parse().ok())
}

fn env_duration_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_date(key: &str) -> Option<NaiveDate> {
    env_str(key).and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
}

fn env_list(key: &str) -> Vec<String> {
    env_str(key)
        .map(|s| {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = CrawlerConfig::default();
        assert_eq!(config.mode, RunMode::Crawl);
        assert!(config.search.quality_threshold.is_none());
        assert_eq!(config.channel_capacity(), 60);
    }

    #[test]
    fn test_run_mode_names() {
        assert_eq!(RunMode::from_name("crawl"), Some(RunMode::Crawl));
        assert_eq!(RunMode::from_name("sync-index"), Some(RunMode::SyncIndex));
        assert_eq!(RunMode::from_name("bogus"), None);
    }

    #[test]
    fn test_pubdate_bounds_closed_interval() {
        let config = SearchConfig {
            min_pubdate: NaiveDate::from_ymd_opt(2024, 1, 1),
            max_pubdate: NaiveDate::from_ymd_opt(2024, 1, 31),
            ..Default::default()
        };
        let (start, end) = config.pubdate_bounds();
        let start = start.unwrap();
        let end = end.unwrap();
        assert!(start < end);
        // The last second of the max day is still inside the window.
        assert_eq!(end - start, 30 * 86_400 + 86_399);
    }

    #[test]
    fn test_channel_capacity_has_floor() {
        let config = CrawlerConfig {
            search: SearchConfig {
                page_size: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.channel_capacity(), 4);
    }
}
