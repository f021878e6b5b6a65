//! Per-item stream download with resume and muxing.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use biliset_client::{Api, DashStream, PlayInfo};
use biliset_models::quality::select_quality;
use biliset_models::{Quality, VideoId};

use crate::disk;
use crate::error::{MediaError, MediaResult};
use crate::fs_utils;
use crate::mux::MuxCommand;

/// `.part` files older than this with a finished sibling are leftovers.
const STALE_PART_AGE: Duration = Duration::from_secs(3600);

/// Downloader configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory holding final media artifacts and `.part` temporaries.
    pub media_dir: PathBuf,
    /// Highest quality the selection may pick.
    pub requested_quality: Quality,
    /// Download retry attempts beyond the first.
    pub retry_times: u32,
    /// Base delay of the download retry backoff.
    pub retry_base_interval: Duration,
    /// Streaming chunk size; also sizes the disk-guard headroom.
    pub chunk_size: u64,
    /// Dataset size cap in GiB; `None` disables the cap.
    pub max_size_gb: Option<u64>,
    /// Container extension of the final artifact.
    pub container_ext: String,
    /// FFmpeg-compatible muxer invocation path.
    pub muxer_tool: PathBuf,
    /// Muxer timeout in seconds.
    pub mux_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("data/media"),
            requested_quality: Quality::default(),
            retry_times: 5,
            retry_base_interval: Duration::from_secs(2),
            chunk_size: 1024 * 1024,
            max_size_gb: None,
            container_ext: "mp4".to_string(),
            muxer_tool: PathBuf::from("ffmpeg"),
            mux_timeout_secs: 300,
        }
    }
}

/// Result of one successful download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// Quality code of the stream that was fetched.
    pub quality_code: u32,
    /// True when nothing at or below the requested quality was available.
    pub downgraded: bool,
}

/// Downloads and muxes one item at a time.
///
/// Each download is serial (video stream, then audio stream, then mux); the
/// orchestrator bounds how many run concurrently.
pub struct StreamDownloader {
    api: Api,
    config: DownloadConfig,
    cancel: Option<watch::Receiver<bool>>,
}

impl StreamDownloader {
    pub fn new(api: Api, config: DownloadConfig) -> Self {
        Self {
            api,
            config,
            cancel: None,
        }
    }

    /// Attach a cancellation signal, checked between chunks.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Download the media artifact for `id`, muxing video and audio into
    /// `<media_dir>/<id>.<ext>`. `cid` selects the segment whose streams
    /// are fetched; `dataset_size_bytes` feeds the size cap.
    pub async fn download(
        &self,
        id: &VideoId,
        cid: u64,
        dataset_size_bytes: u64,
    ) -> MediaResult<DownloadOutcome> {
        let final_path = self
            .config
            .media_dir
            .join(id.media_filename(&self.config.container_ext));

        // A complete artifact from a previous run wins outright.
        if final_path.exists() {
            let bytes = fs::metadata(&final_path).await?.len();
            info!(video_id = %id, path = %final_path.display(), "media artifact already present");
            return Ok(DownloadOutcome {
                path: final_path,
                bytes,
                quality_code: self.config.requested_quality.code(),
                downgraded: false,
            });
        }

        fs::create_dir_all(&self.config.media_dir).await?;
        disk::ensure_capacity(
            &self.config.media_dir,
            self.config.chunk_size,
            dataset_size_bytes,
            self.config.max_size_gb,
        )?;

        let play = self
            .api
            .play_url(id.as_str(), cid, self.config.requested_quality.code())
            .await?;
        let streams = self.resolve_streams(id, &play)?;

        let video_part = self.config.media_dir.join(format!("{id}.video.part"));
        let audio_part = self.config.media_dir.join(format!("{id}.audio.part"));

        self.fetch_stream(id, &streams.video_url, &video_part)
            .await?;

        let bytes = match &streams.audio_url {
            Some(audio_url) => {
                self.fetch_stream(id, audio_url, &audio_part).await?;

                let mux = MuxCommand::new(
                    &self.config.muxer_tool,
                    &video_part,
                    &audio_part,
                    &final_path,
                )
                .with_timeout(self.config.mux_timeout_secs);
                // On mux failure the .part files stay behind for inspection.
                mux.run().await?;

                fs_utils::remove_files(&[video_part.as_path(), audio_part.as_path()]).await;
                fs::metadata(&final_path).await?.len()
            }
            None => {
                // Single-file representation already carries the audio.
                fs_utils::move_file(&video_part, &final_path).await?;
                fs::metadata(&final_path).await?.len()
            }
        };

        info!(
            video_id = %id,
            path = %final_path.display(),
            size_mb = bytes as f64 / 1_048_576.0,
            quality = streams.quality_code,
            "download complete"
        );

        Ok(DownloadOutcome {
            path: final_path,
            bytes,
            quality_code: streams.quality_code,
            downgraded: streams.downgraded,
        })
    }

    /// Pick the stream URLs for this item.
    fn resolve_streams(&self, id: &VideoId, play: &PlayInfo) -> MediaResult<ResolvedStreams> {
        if let Some(dash) = &play.dash {
            if dash.video.is_empty() {
                return Err(MediaError::NoStreams);
            }
            let codes: Vec<u32> = dash.video.iter().map(|s| s.id).collect();
            let selected = select_quality(&codes, self.config.requested_quality)
                .ok_or(MediaError::NoStreams)?;
            if selected.downgraded {
                warn!(
                    video_id = %id,
                    requested = self.config.requested_quality.code(),
                    got = selected.code,
                    "requested quality unavailable, downgrading to lowest present"
                );
            }
            let video = dash
                .video
                .iter()
                .find(|s| s.id == selected.code)
                .ok_or(MediaError::NoStreams)?;
            let audio = dash
                .audio
                .as_ref()
                .and_then(|streams| pick_audio(streams));

            return Ok(ResolvedStreams {
                video_url: video.base_url.clone(),
                audio_url: audio.map(|a| a.base_url.clone()),
                quality_code: selected.code,
                downgraded: selected.downgraded,
            });
        }

        if let Some(durl) = &play.durl {
            if let Some(first) = durl.first() {
                debug!(video_id = %id, "single-file stream representation");
                return Ok(ResolvedStreams {
                    video_url: first.url.clone(),
                    audio_url: None,
                    quality_code: self.config.requested_quality.code(),
                    downgraded: false,
                });
            }
        }

        Err(MediaError::NoStreams)
    }

    /// Stream one URL into a `.part` file with byte-range resume.
    async fn fetch_stream(&self, id: &VideoId, url: &str, part: &Path) -> MediaResult<()> {
        let max_attempts = self.config.retry_times + 1;
        let mut last_error: Option<MediaError> = None;

        for attempt in 1..=max_attempts {
            self.check_cancelled()?;

            let result = self.fetch_stream_once(url, part).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self
                        .config
                        .retry_base_interval
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    warn!(
                        video_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "stream fetch failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| MediaError::download_failed("stream retry budget exhausted")))
    }

    async fn fetch_stream_once(&self, url: &str, part: &Path) -> MediaResult<()> {
        let transport = self.api.transport();

        let expected = transport.content_length(url).await.unwrap_or(None);

        let resume_from = match fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if let Some(total) = expected {
            if resume_from >= total && total > 0 {
                debug!(part = %part.display(), "part file already complete");
                return Ok(());
            }
        }

        let response = transport.stream_get(url, Some(resume_from)).await?;
        // A 200 on a resume attempt means the server ignored the Range
        // header; start the file over.
        let append = resume_from > 0 && response.status().as_u16() == 206;
        if resume_from > 0 {
            if append {
                debug!(
                    part = %part.display(),
                    resume_from,
                    "resuming partial download via Range request"
                );
            } else {
                debug!(part = %part.display(), "server ignored Range, restarting stream");
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(part)
            .await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.check_cancelled()?;
            let chunk = chunk.map_err(|e| MediaError::download_failed(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if let Some(total) = expected {
            let actual = fs::metadata(part).await?.len();
            if actual != total {
                // A short read leaves a poisoned file; drop it so the retry
                // starts clean rather than resuming garbage.
                let _ = fs::remove_file(part).await;
                return Err(MediaError::LengthMismatch {
                    expected: total,
                    actual,
                });
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> MediaResult<()> {
        if let Some(cancel) = &self.cancel {
            if *cancel.borrow() {
                return Err(MediaError::Cancelled);
            }
        }
        Ok(())
    }

    /// Remove `.part` leftovers older than an hour whose item already has a
    /// final artifact. Parts without a finished sibling are kept: they are
    /// resumable state for the next run.
    pub async fn cleanup_stale_parts(&self) -> MediaResult<u64> {
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.config.media_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".video.part").or_else(|| name.strip_suffix(".audio.part")) else {
                continue;
            };

            let finished = self
                .config
                .media_dir
                .join(format!("{stem}.{}", self.config.container_ext));
            if !finished.exists() {
                continue;
            }

            let old_enough = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .is_some_and(|age| age > STALE_PART_AGE);
            if old_enough {
                if fs::remove_file(&path).await.is_ok() {
                    debug!(path = %path.display(), "removed stale part file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

struct ResolvedStreams {
    video_url: String,
    audio_url: Option<String>,
    quality_code: u32,
    downgraded: bool,
}

/// Highest-bandwidth audio representation wins.
fn pick_audio(streams: &[DashStream]) -> Option<&DashStream> {
    streams.iter().max_by_key(|s| s.bandwidth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use biliset_client::{Transport, TransportConfig};
    use std::sync::Arc;

    fn downloader(dir: &Path) -> StreamDownloader {
        let transport = Arc::new(Transport::new(TransportConfig::default()).unwrap());
        StreamDownloader::new(
            Api::new(transport),
            DownloadConfig {
                media_dir: dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn play_info(json: &str) -> PlayInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_resolve_dash_streams_picks_requested_quality() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();

        let play = play_info(
            r#"{"dash": {
                "video": [
                    {"id": 16, "baseUrl": "https://cdn/v16"},
                    {"id": 32, "baseUrl": "https://cdn/v32"},
                    {"id": 64, "baseUrl": "https://cdn/v64"}
                ],
                "audio": [
                    {"id": 30216, "baseUrl": "https://cdn/a-low", "bandwidth": 64000},
                    {"id": 30280, "baseUrl": "https://cdn/a-high", "bandwidth": 192000}
                ]
            }}"#,
        );

        let resolved = dl.resolve_streams(&id, &play).unwrap();
        assert_eq!(resolved.video_url, "https://cdn/v32");
        assert_eq!(resolved.audio_url.as_deref(), Some("https://cdn/a-high"));
        assert_eq!(resolved.quality_code, 32);
        assert!(!resolved.downgraded);
    }

    #[test]
    fn test_resolve_dash_downgrades_when_nothing_fits() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();

        let play = play_info(
            r#"{"dash": {"video": [
                {"id": 80, "baseUrl": "https://cdn/v80"},
                {"id": 116, "baseUrl": "https://cdn/v116"}
            ]}}"#,
        );

        let resolved = dl.resolve_streams(&id, &play).unwrap();
        assert_eq!(resolved.quality_code, 80);
        assert!(resolved.downgraded);
        assert!(resolved.audio_url.is_none());
    }

    #[test]
    fn test_resolve_durl_single_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();

        let play = play_info(r#"{"durl": [{"url": "https://cdn/whole.flv", "size": 1234}]}"#);
        let resolved = dl.resolve_streams(&id, &play).unwrap();
        assert_eq!(resolved.video_url, "https://cdn/whole.flv");
        assert!(resolved.audio_url.is_none());
    }

    #[test]
    fn test_resolve_empty_play_info_is_no_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();
        let play = play_info("{}");
        assert!(matches!(
            dl.resolve_streams(&id, &play),
            Err(MediaError::NoStreams)
        ));
    }

    #[tokio::test]
    async fn test_existing_artifact_short_circuits() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());
        let id = VideoId::parse("BV1GJ411x7h7").unwrap();

        let final_path = dir.path().join("BV1GJ411x7h7.mp4");
        tokio::fs::write(&final_path, b"already muxed").await.unwrap();

        // No network call happens: the artifact wins before stream resolution.
        let outcome = dl.download(&id, 1, 0).await.unwrap();
        assert_eq!(outcome.path, final_path);
        assert_eq!(outcome.bytes, 13);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_parts_without_finished_sibling() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());

        let orphan_part = dir.path().join("BV1xx411c7aa.video.part");
        tokio::fs::write(&orphan_part, b"resumable").await.unwrap();

        let removed = dl.cleanup_stale_parts().await.unwrap();
        assert_eq!(removed, 0);
        assert!(orphan_part.exists());
    }

    #[tokio::test]
    async fn test_cleanup_ignores_fresh_parts_with_sibling() {
        let dir = tempfile::TempDir::new().unwrap();
        let dl = downloader(dir.path());

        tokio::fs::write(dir.path().join("BV1xx411c7aa.mp4"), b"done")
            .await
            .unwrap();
        let fresh_part = dir.path().join("BV1xx411c7aa.video.part");
        tokio::fs::write(&fresh_part, b"fresh").await.unwrap();

        // Freshly written: below the stale age, must survive.
        let removed = dl.cleanup_stale_parts().await.unwrap();
        assert_eq!(removed, 0);
        assert!(fresh_part.exists());
    }
}
