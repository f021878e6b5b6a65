//! Metadata collection: fetch, normalize, commit.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use biliset_client::{Api, ViewData};
use biliset_models::utils::clamp_counter;
use biliset_models::{
    BasicInfo, CrawlInfo, MetadataRecord, Owner, PageInfo, StatCounts, VideoId,
    METADATA_SCHEMA_VERSION,
};
use biliset_store::DatasetStore;

use crate::error::CrawlerResult;

/// Fetches per-item detail records and commits them to the store.
///
/// Collecting an id that already has a record overwrites the file and its
/// index entry in one commit; the index entry count stays one.
pub struct MetadataCollector {
    api: Api,
    store: Arc<DatasetStore>,
}

impl MetadataCollector {
    pub fn new(api: Api, store: Arc<DatasetStore>) -> Self {
        Self { api, store }
    }

    /// Fetch, normalize and persist the metadata record for one id.
    pub async fn collect(&self, id: &VideoId) -> CrawlerResult<MetadataRecord> {
        debug!(video_id = %id, "collecting metadata");
        let view = self.api.video_view(id.as_str()).await?;

        // Tags are enrichment; their failure never fails the item.
        let tags = match self.api.video_tags(id.as_str()).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(video_id = %id, "tag fetch failed, continuing without: {e}");
                Vec::new()
            }
        };

        let mut record = compose(id, view, tags);
        record.normalize()?;

        self.store.put_metadata(&record).await?;
        info!(
            video_id = %id,
            duration = record.duration(),
            "metadata committed"
        );
        Ok(record)
    }
}

/// Compose a normalized record from the wire detail document. Counters are
/// clamped to non-negative values at this boundary.
fn compose(id: &VideoId, view: ViewData, tags: Vec<String>) -> MetadataRecord {
    MetadataRecord {
        basic_info: BasicInfo {
            bvid: id.clone(),
            aid: view.aid,
            title: view.title,
            desc: view.desc,
            duration: view.duration,
            pubdate: view.pubdate,
            pic: view.pic,
        },
        owner: Owner {
            mid: view.owner.mid,
            name: view.owner.name,
            face: view.owner.face,
        },
        stat: StatCounts {
            view: clamp_counter(view.stat.view),
            danmaku: clamp_counter(view.stat.danmaku),
            reply: clamp_counter(view.stat.reply),
            favorite: clamp_counter(view.stat.favorite),
            coin: clamp_counter(view.stat.coin),
            share: clamp_counter(view.stat.share),
            like: clamp_counter(view.stat.like),
        },
        pages: view
            .pages
            .into_iter()
            .map(|p| PageInfo {
                cid: p.cid,
                page: p.page,
                part: p.part,
                duration: p.duration,
            })
            .collect(),
        tags,
        crawl_info: CrawlInfo {
            crawled_at: Utc::now(),
            schema_version: METADATA_SCHEMA_VERSION,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(json: serde_json::Value) -> ViewData {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_compose_clamps_negative_counters() {
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();
        let view = view(serde_json::json!({
            "bvid": "BV1GJ411x7h7",
            "aid": 17,
            "title": "  spaced title ",
            "duration": 42,
            "pubdate": 1_700_000_000,
            "owner": {"mid": 9, "name": "up"},
            "stat": {"view": -5, "like": 7},
            "pages": [{"cid": 101, "page": 1, "part": "p1", "duration": 42}]
        }));

        let mut record = compose(&id, view, vec!["tag".to_string()]);
        record.normalize().unwrap();

        assert_eq!(record.stat.view, 0);
        assert_eq!(record.stat.like, 7);
        assert_eq!(record.basic_info.title, "spaced title");
        assert_eq!(record.pages[0].cid, 101);
        assert_eq!(record.tags, vec!["tag".to_string()]);
    }

    #[test]
    fn test_compose_rejects_record_without_owner() {
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();
        let view = view(serde_json::json!({
            "bvid": "BV1GJ411x7h7",
            "title": "t",
            "duration": 42
        }));
        let mut record = compose(&id, view, Vec::new());
        assert!(record.normalize().is_err());
    }
}
