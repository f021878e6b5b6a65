//! Typed wrappers over the remote service endpoints.
//!
//! Wire DTOs are decoded here at the boundary; nothing outside this module
//! deals with untyped JSON from the service.

use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::transport::Transport;

const API_BASE: &str = "https://api.bilibili.com";

/// Endpoint client. Cheap to clone; all state lives in the transport.
#[derive(Clone)]
pub struct Api {
    transport: Arc<Transport>,
}

impl Api {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// The underlying transport, for byte-stream fetches.
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// One page of keyword search results.
    pub async fn search_page(
        &self,
        keyword: &str,
        page: u32,
        page_size: u32,
        order: &str,
    ) -> ClientResult<SearchPage> {
        let url = format!("{API_BASE}/x/web-interface/search/type");
        let query = vec![
            ("search_type".to_string(), "video".to_string()),
            ("keyword".to_string(), keyword.to_string()),
            ("page".to_string(), page.to_string()),
            ("page_size".to_string(), page_size.to_string()),
            ("order".to_string(), order.to_string()),
        ];
        let data: SearchData = self
            .transport
            .request(Method::GET, &url, &query, None)
            .await?;

        let has_more = match data.num_pages {
            Some(pages) => page < pages,
            None => data.result.len() as u32 == page_size,
        };
        debug!(
            keyword,
            page,
            hits = data.result.len(),
            has_more,
            "search page fetched"
        );
        Ok(SearchPage {
            hits: data.result,
            has_more,
        })
    }

    /// Detail record of one video.
    pub async fn video_view(&self, bvid: &str) -> ClientResult<ViewData> {
        let url = format!("{API_BASE}/x/web-interface/view");
        let query = vec![("bvid".to_string(), bvid.to_string())];
        self.transport.request(Method::GET, &url, &query, None).await
    }

    /// Tag names attached to one video.
    pub async fn video_tags(&self, bvid: &str) -> ClientResult<Vec<String>> {
        let url = format!("{API_BASE}/x/tag/archive/tags");
        let query = vec![("bvid".to_string(), bvid.to_string())];
        let tags: Vec<TagData> = self
            .transport
            .request(Method::GET, &url, &query, None)
            .await?;
        Ok(tags.into_iter().map(|t| t.tag_name).collect())
    }

    /// Stream descriptors for one segment at the requested quality code.
    pub async fn play_url(&self, bvid: &str, cid: u64, qn: u32) -> ClientResult<PlayInfo> {
        let url = format!("{API_BASE}/x/player/playurl");
        let query = vec![
            ("bvid".to_string(), bvid.to_string()),
            ("cid".to_string(), cid.to_string()),
            ("qn".to_string(), qn.to_string()),
            // Request the segmented (DASH) representation.
            ("fnval".to_string(), "16".to_string()),
            ("fourk".to_string(), "1".to_string()),
        ];
        self.transport.request(Method::GET, &url, &query, None).await
    }

    /// Lightweight authenticated identity probe.
    pub async fn nav(&self) -> ClientResult<NavIdentity> {
        let url = format!("{API_BASE}/x/web-interface/nav");
        match self
            .transport
            .request::<NavIdentity>(Method::GET, &url, &[], None)
            .await
        {
            Ok(identity) => Ok(identity),
            // The nav endpoint reports a logged-out session as an auth
            // error; normalize that into an identity the caller can read.
            Err(ClientError::AuthExpired) => Ok(NavIdentity::default()),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Wire DTOs
// =============================================================================

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(default)]
    result: Vec<SearchHit>,
    #[serde(default, alias = "numPages")]
    num_pages: Option<u32>,
}

/// One search result row, as the service renders it.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    /// Result type discriminator; only `"video"` rows carry an id.
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub bvid: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub mid: i64,
    #[serde(default)]
    pub play: i64,
    #[serde(default)]
    pub like: i64,
    #[serde(default)]
    pub favorites: i64,
    /// Duration rendered as `MM:SS` or `HH:MM:SS`.
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub pubdate: i64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub description: String,
}

/// A decoded page of search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub has_more: bool,
}

/// Detail record of one video.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewData {
    pub bvid: String,
    #[serde(default)]
    pub aid: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub pubdate: i64,
    #[serde(default)]
    pub pic: String,
    #[serde(default)]
    pub owner: OwnerData,
    #[serde(default)]
    pub stat: StatData,
    #[serde(default)]
    pub pages: Vec<PageData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerData {
    #[serde(default)]
    pub mid: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub face: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatData {
    #[serde(default)]
    pub view: i64,
    #[serde(default)]
    pub danmaku: i64,
    #[serde(default)]
    pub reply: i64,
    #[serde(default)]
    pub favorite: i64,
    #[serde(default)]
    pub coin: i64,
    #[serde(default)]
    pub share: i64,
    #[serde(default)]
    pub like: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageData {
    pub cid: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub part: String,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Deserialize)]
struct TagData {
    #[serde(default)]
    tag_name: String,
}

/// Stream descriptors for one segment.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayInfo {
    #[serde(default)]
    pub accept_quality: Vec<u32>,
    #[serde(default)]
    pub dash: Option<DashInfo>,
    /// Legacy single-file representation; present when DASH is not.
    #[serde(default)]
    pub durl: Option<Vec<DurlSegment>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashInfo {
    #[serde(default)]
    pub video: Vec<DashStream>,
    #[serde(default)]
    pub audio: Option<Vec<DashStream>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashStream {
    /// Quality code of this representation.
    pub id: u32,
    #[serde(alias = "baseUrl")]
    pub base_url: String,
    #[serde(default)]
    pub bandwidth: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DurlSegment {
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

/// Identity of the session owner.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NavIdentity {
    #[serde(default, alias = "isLogin")]
    pub is_login: bool,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub mid: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_hit_decodes_partial_rows() {
        let hit: SearchHit = serde_json::from_str(
            r#"{"type": "video", "bvid": "BV1GJ411x7h7", "title": "t", "duration": "12:34"}"#,
        )
        .unwrap();
        assert_eq!(hit.bvid.as_deref(), Some("BV1GJ411x7h7"));
        assert_eq!(hit.play, 0);
        assert_eq!(hit.duration, "12:34");
    }

    #[test]
    fn test_non_video_rows_decode_without_bvid() {
        let hit: SearchHit =
            serde_json::from_str(r#"{"type": "media_bangumi", "title": "x"}"#).unwrap();
        assert_eq!(hit.item_type, "media_bangumi");
        assert!(hit.bvid.is_none());
    }

    #[test]
    fn test_play_info_decodes_dash_camel_case_url() {
        let info: PlayInfo = serde_json::from_str(
            r#"{
                "accept_quality": [80, 64, 32, 16],
                "dash": {
                    "video": [{"id": 32, "baseUrl": "https://cdn/v.m4s", "bandwidth": 500}],
                    "audio": [{"id": 30216, "base_url": "https://cdn/a.m4s"}]
                }
            }"#,
        )
        .unwrap();
        let dash = info.dash.unwrap();
        assert_eq!(dash.video[0].base_url, "https://cdn/v.m4s");
        assert_eq!(dash.audio.unwrap()[0].base_url, "https://cdn/a.m4s");
        assert_eq!(info.accept_quality, vec![80, 64, 32, 16]);
    }

    #[test]
    fn test_view_data_defaults_for_missing_blocks() {
        let view: ViewData =
            serde_json::from_str(r#"{"bvid": "BV1GJ411x7h7", "duration": 30}"#).unwrap();
        assert_eq!(view.owner.mid, 0);
        assert_eq!(view.stat.view, 0);
        assert!(view.pages.is_empty());
    }

    #[test]
    fn test_nav_identity_alias() {
        let identity: NavIdentity =
            serde_json::from_str(r#"{"isLogin": true, "uname": "u", "mid": 9}"#).unwrap();
        assert!(identity.is_login);
    }
}
