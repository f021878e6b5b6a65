//! Keyword search: pagination, normalization, filtering, de-duplication.

use std::collections::HashSet;
use std::sync::Mutex;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use biliset_client::{Api, SearchHit};
use biliset_models::{parse_duration_text, Candidate, VideoId};

use crate::config::SearchConfig;
use crate::error::{CrawlerError, CrawlerResult};

/// Highlight markup the search endpoint wraps around matched terms.
const EM_OPEN: &str = "<em class=\"keyword\">";
const EM_CLOSE: &str = "</em>";

/// Totals from one keyword's search.
#[derive(Debug, Default, Clone, Copy)]
pub struct SearchTotals {
    /// Rows returned by the remote, before any filtering.
    pub seen: u64,
    /// Candidates that passed the filters and were emitted.
    pub emitted: u64,
}

/// Translates keywords into a de-duplicated stream of candidates.
///
/// The seen-id set spans every keyword of one invocation, so a video found
/// under two keywords is emitted once, under the first.
pub struct SearchEngine {
    api: Api,
    config: SearchConfig,
    seen: Mutex<HashSet<VideoId>>,
}

impl SearchEngine {
    pub fn new(api: Api, config: SearchConfig) -> Self {
        Self {
            api,
            config,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Search one keyword, emitting accepted candidates into `sink` in the
    /// order the remote returned them. Blocking sends provide the
    /// backpressure that throttles paging when downstream stages lag.
    ///
    /// A failed page is skipped; only a keyword where every page failed
    /// surfaces [`CrawlerError::SearchFailed`].
    pub async fn search(
        &self,
        keyword: &str,
        limit: u64,
        sink: &mpsc::Sender<Candidate>,
        shutdown: &watch::Receiver<bool>,
    ) -> CrawlerResult<SearchTotals> {
        info!(keyword, limit, "searching keyword");
        let mut totals = SearchTotals::default();
        let mut any_page_succeeded = false;

        for page in 1..=self.config.max_pages {
            if *shutdown.borrow() {
                break;
            }
            self.page_pause().await;

            let result = self
                .api
                .search_page(keyword, page, self.config.page_size, &self.config.order)
                .await;
            let page_data = match result {
                Ok(data) => data,
                Err(e) => {
                    // The transport already retried; skip the page.
                    warn!(keyword, page, "search page failed after retries: {e}");
                    continue;
                }
            };
            any_page_succeeded = true;

            let hit_count = page_data.hits.len();
            for hit in page_data.hits {
                totals.seen += 1;
                let Some(candidate) = self.accept(hit, keyword) else {
                    continue;
                };
                if sink.send(candidate).await.is_err() {
                    // Downstream closed: the run is winding down.
                    return Ok(totals);
                }
                totals.emitted += 1;
                if totals.emitted >= limit {
                    info!(keyword, limit, "per-keyword limit reached");
                    return Ok(totals);
                }
            }

            debug!(keyword, page, hit_count, emitted = totals.emitted, "page done");
            if !page_data.has_more {
                break;
            }
        }

        if !any_page_succeeded {
            return Err(CrawlerError::SearchFailed {
                keyword: keyword.to_string(),
            });
        }
        info!(keyword, emitted = totals.emitted, seen = totals.seen, "keyword finished");
        Ok(totals)
    }

    /// Normalize a raw hit and run it through the filters. Returns the
    /// candidate when it should be processed, `None` when dropped.
    fn accept(&self, hit: SearchHit, keyword: &str) -> Option<Candidate> {
        if hit.item_type != "video" {
            return None;
        }
        let id = VideoId::parse(hit.bvid.as_deref()?).ok()?;

        // Silent de-duplication across all keywords of this invocation.
        {
            let mut seen = self.seen.lock().ok()?;
            if !seen.insert(id.clone()) {
                return None;
            }
        }

        let title = strip_highlight(&hit.title);
        let candidate = Candidate {
            id,
            duration_secs: parse_duration_text(&hit.duration),
            pubdate: hit.pubdate,
            uploader_id: hit.mid,
            uploader_name: hit.author,
            play_count: hit.play.max(0) as u64,
            like_count: hit.like.max(0) as u64,
            favorite_count: hit.favorites.max(0) as u64,
            coin_count: 0,
            keyword: keyword.to_string(),
            title,
        };

        self.passes_filters(&candidate).then_some(candidate)
    }

    fn passes_filters(&self, candidate: &Candidate) -> bool {
        // Closed duration interval; an unparseable duration is left for the
        // metadata-level filter to judge.
        if let Some(duration) = candidate.duration_secs {
            if let Some(min) = self.config.min_duration {
                if duration < min {
                    return false;
                }
            }
            if let Some(max) = self.config.max_duration {
                if duration > max {
                    return false;
                }
            }
        }

        if candidate.play_count < self.config.min_view_count {
            return false;
        }

        let (min_ts, max_ts) = self.config.pubdate_bounds();
        if candidate.pubdate > 0 {
            if let Some(min) = min_ts {
                if candidate.pubdate < min {
                    return false;
                }
            }
            if let Some(max) = max_ts {
                if candidate.pubdate > max {
                    return false;
                }
            }
        }

        let title = candidate.title.to_lowercase();
        if !self.config.keyword_filters.is_empty()
            && !self
                .config
                .keyword_filters
                .iter()
                .any(|kw| title.contains(&kw.to_lowercase()))
        {
            return false;
        }
        if self
            .config
            .keyword_excludes
            .iter()
            .any(|kw| title.contains(&kw.to_lowercase()))
        {
            return false;
        }

        if let Some(quality) = &self.config.quality_threshold {
            let score = candidate.quality_score(quality.w_like, quality.w_coin, quality.w_fav);
            if score < quality.threshold {
                return false;
            }
        }

        true
    }

    /// Uniformly sampled pause between page requests.
    async fn page_pause(&self) {
        let (lo, hi) = self.config.page_interval;
        let delay = if hi > lo {
            let span = (hi - lo).as_millis() as u64;
            lo + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=span))
        } else {
            lo
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Remove the highlight markup the search endpoint injects into titles.
fn strip_highlight(title: &str) -> String {
    title.replace(EM_OPEN, "").replace(EM_CLOSE, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use biliset_client::{Transport, TransportConfig};
    use std::sync::Arc;

    fn engine(config: SearchConfig) -> SearchEngine {
        let transport = Arc::new(Transport::new(TransportConfig::default()).unwrap());
        SearchEngine::new(Api::new(transport), config)
    }

    fn hit(bvid: &str, title: &str, play: i64, duration: &str, pubdate: i64) -> SearchHit {
        serde_json::from_value(serde_json::json!({
            "type": "video",
            "bvid": bvid,
            "title": title,
            "author": "up",
            "mid": 1,
            "play": play,
            "like": 10,
            "favorites": 2,
            "duration": duration,
            "pubdate": pubdate,
        }))
        .unwrap()
    }

    #[test]
    fn test_strip_highlight() {
        assert_eq!(
            strip_highlight("a <em class=\"keyword\">cat</em> video"),
            "a cat video"
        );
        assert_eq!(strip_highlight("plain"), "plain");
    }

    #[test]
    fn test_accept_drops_non_video_and_invalid_ids() {
        let engine = engine(SearchConfig::default());
        let mut non_video = hit("BV1GJ411x7h7", "t", 100, "1:00", 0);
        non_video.item_type = "media_bangumi".to_string();
        assert!(engine.accept(non_video, "kw").is_none());

        let bad_id = hit("av12345", "t", 100, "1:00", 0);
        assert!(engine.accept(bad_id, "kw").is_none());
    }

    #[test]
    fn test_accept_deduplicates_across_calls() {
        let engine = engine(SearchConfig::default());
        assert!(engine
            .accept(hit("BV1GJ411x7h7", "first", 100, "1:00", 0), "kw1")
            .is_some());
        // Same id under another keyword: silently dropped.
        assert!(engine
            .accept(hit("BV1GJ411x7h7", "again", 100, "1:00", 0), "kw2")
            .is_none());
    }

    #[test]
    fn test_duration_interval_is_closed() {
        let engine = engine(SearchConfig {
            min_duration: Some(30),
            max_duration: Some(60),
            ..Default::default()
        });
        assert!(engine
            .accept(hit("BV1aaa0000aa", "t", 0, "1:00", 0), "kw")
            .is_some());
        assert!(engine
            .accept(hit("BV1bbb0000bb", "t", 0, "0:30", 0), "kw")
            .is_some());
        assert!(engine
            .accept(hit("BV1ccc0000cc", "t", 0, "1:01", 0), "kw")
            .is_none());
        assert!(engine
            .accept(hit("BV1ddd0000dd", "t", 0, "0:29", 0), "kw")
            .is_none());
    }

    #[test]
    fn test_min_view_count_filter() {
        let engine = engine(SearchConfig {
            min_view_count: 1000,
            ..Default::default()
        });
        assert!(engine
            .accept(hit("BV1aaa0000aa", "t", 999, "1:00", 0), "kw")
            .is_none());
        assert!(engine
            .accept(hit("BV1bbb0000bb", "t", 1000, "1:00", 0), "kw")
            .is_some());
    }

    #[test]
    fn test_title_include_exclude_filters() {
        let engine = engine(SearchConfig {
            keyword_filters: vec!["Cat".to_string()],
            keyword_excludes: vec!["compilation".to_string()],
            ..Default::default()
        });
        assert!(engine
            .accept(hit("BV1aaa0000aa", "my CAT clip", 0, "1:00", 0), "kw")
            .is_some());
        assert!(engine
            .accept(hit("BV1bbb0000bb", "dog clip", 0, "1:00", 0), "kw")
            .is_none());
        assert!(engine
            .accept(
                hit("BV1ccc0000cc", "cat Compilation 2024", 0, "1:00", 0),
                "kw"
            )
            .is_none());
    }

    #[test]
    fn test_pubdate_window() {
        let engine = engine(SearchConfig {
            min_pubdate: chrono::NaiveDate::from_ymd_opt(2024, 1, 1),
            max_pubdate: chrono::NaiveDate::from_ymd_opt(2024, 12, 31),
            ..Default::default()
        });
        // Mid-2024 passes.
        assert!(engine
            .accept(hit("BV1aaa0000aa", "t", 0, "1:00", 1_717_200_000), "kw")
            .is_some());
        // 2023 rejected.
        assert!(engine
            .accept(hit("BV1bbb0000bb", "t", 0, "1:00", 1_672_531_200), "kw")
            .is_none());
        // Unknown pubdate is kept.
        assert!(engine
            .accept(hit("BV1ccc0000cc", "t", 0, "1:00", 0), "kw")
            .is_some());
    }

    #[test]
    fn test_quality_threshold_filter() {
        let engine = engine(SearchConfig {
            quality_threshold: Some(crate::config::QualityThreshold {
                threshold: 0.05,
                w_like: 1.0,
                w_coin: 0.0,
                w_fav: 0.0,
            }),
            ..Default::default()
        });
        // 10 likes / 1000 plays = 0.01 < 0.05.
        assert!(engine
            .accept(hit("BV1aaa0000aa", "t", 1000, "1:00", 0), "kw")
            .is_none());
        // 10 likes / 100 plays = 0.1 >= 0.05.
        assert!(engine
            .accept(hit("BV1bbb0000bb", "t", 100, "1:00", 0), "kw")
            .is_some());
    }
}
