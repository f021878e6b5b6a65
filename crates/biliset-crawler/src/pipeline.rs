//! Bounded-concurrency pipeline: search → metadata → download.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use biliset_client::{Api, ClientError, SessionManager};
use biliset_media::StreamDownloader;
use biliset_models::{Candidate, ErrorKind, MetadataRecord, RunReport, VideoId};
use biliset_store::DatasetStore;

use crate::breaker::FailureBreaker;
use crate::collector::MetadataCollector;
use crate::config::CrawlerConfig;
use crate::error::{CrawlerError, CrawlerResult};
use crate::search::SearchEngine;

/// An item whose metadata is committed and which is cleared for download.
#[derive(Debug, Clone)]
struct ReadyItem {
    id: VideoId,
    /// Segment identifier used by the stream endpoints.
    cid: u64,
}

/// Shared mutable state of one run.
struct RunState {
    report: Mutex<RunReport>,
    fatal: Mutex<Option<CrawlerError>>,
    breaker: FailureBreaker,
    /// One re-auth attempt is allowed per run; the second expiry aborts.
    reauth_used: AtomicBool,
    /// Downloads halt once the disk guard fires.
    disk_full: AtomicBool,
    /// Items committed this run, for the global cap.
    committed: AtomicU64,
}

impl RunState {
    fn new() -> Self {
        Self {
            report: Mutex::new(RunReport::default()),
            fatal: Mutex::new(None),
            breaker: FailureBreaker::default(),
            reauth_used: AtomicBool::new(false),
            disk_full: AtomicBool::new(false),
            committed: AtomicU64::new(0),
        }
    }

    fn with_report<F: FnOnce(&mut RunReport)>(&self, f: F) {
        if let Ok(mut report) = self.report.lock() {
            f(&mut report);
        }
    }

    fn record_error(&self, kind: ErrorKind) {
        self.with_report(|r| r.record_error(degrade(kind)));
    }

    fn set_fatal(&self, e: CrawlerError) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
    }

    fn is_fatal(&self) -> bool {
        self.fatal.lock().map(|f| f.is_some()).unwrap_or(false)
    }
}

/// Retry exhaustion degrades transient failures to per-item outcomes.
fn degrade(kind: ErrorKind) -> ErrorKind {
    match kind {
        ErrorKind::Transient | ErrorKind::RateLimited => ErrorKind::PerItemFailed,
        kind => kind,
    }
}

/// Wires session, search, collection, download and the dataset store into
/// one bounded-concurrency run.
pub struct Pipeline {
    config: CrawlerConfig,
    api: Api,
    store: Arc<DatasetStore>,
    session: Arc<SessionManager>,
}

impl Pipeline {
    pub fn new(
        config: CrawlerConfig,
        api: Api,
        store: Arc<DatasetStore>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            api,
            store,
            session,
        }
    }

    /// Run the crawl. `shutdown` doubles as the external cancellation
    /// signal (Ctrl-C) and the internal halt trigger; no new work is pulled
    /// once it fires, and in-flight downloads stop at the next chunk.
    pub async fn run(&self, shutdown: watch::Sender<bool>) -> CrawlerResult<RunReport> {
        let state = Arc::new(RunState::new());
        let capacity = self.config.channel_capacity();

        let (candidate_tx, candidate_rx) = mpsc::channel::<Candidate>(capacity);
        let (ready_tx, ready_rx) = mpsc::channel::<ReadyItem>(capacity);
        let candidate_rx = Arc::new(AsyncMutex::new(candidate_rx));
        let ready_rx = Arc::new(AsyncMutex::new(ready_rx));

        // Download stage: `concurrent_limit` workers bound the in-flight
        // downloads process-wide.
        let mut download_handles = Vec::new();
        if self.config.download {
            for worker in 0..self.config.concurrent_limit.max(1) {
                let ready_rx = Arc::clone(&ready_rx);
                let state = Arc::clone(&state);
                let store = Arc::clone(&self.store);
                let downloader = StreamDownloader::new(
                    self.api.clone(),
                    self.config.downloader.clone(),
                )
                .with_cancel(shutdown.subscribe());
                let shutdown_rx = shutdown.subscribe();

                download_handles.push(tokio::spawn(async move {
                    download_worker(worker, ready_rx, downloader, store, state, shutdown_rx)
                        .await;
                }));
            }
        }

        // Resume path: re-feed items that have metadata but no media.
        if self.config.download && self.config.resume {
            self.seed_missing_media(&ready_tx, &state).await;
        }

        // Metadata stage.
        let collector = Arc::new(MetadataCollector::new(
            self.api.clone(),
            Arc::clone(&self.store),
        ));
        let mut metadata_handles = Vec::new();
        for worker in 0..self.config.metadata_workers.max(1) {
            let candidate_rx = Arc::clone(&candidate_rx);
            let ready_tx = ready_tx.clone();
            let state = Arc::clone(&state);
            let collector = Arc::clone(&collector);
            let store = Arc::clone(&self.store);
            let session = Arc::clone(&self.session);
            let config = self.config.clone();
            let shutdown_tx = shutdown.clone();

            metadata_handles.push(tokio::spawn(async move {
                metadata_worker(
                    worker,
                    candidate_rx,
                    ready_tx,
                    collector,
                    store,
                    session,
                    config,
                    state,
                    shutdown_tx,
                )
                .await;
            }));
        }
        // Only worker-held clones keep the ready channel open now.
        drop(ready_tx);

        // Search stage: sequential per keyword.
        let engine = SearchEngine::new(self.api.clone(), self.config.search.clone());
        let keywords = self.config.keywords.clone();
        let limit = self.config.limit_per_keyword;
        let shutdown_rx = shutdown.subscribe();
        {
            let state = Arc::clone(&state);
            for keyword in keywords {
                if *shutdown_rx.borrow() || state.is_fatal() || state.breaker.tripped() {
                    break;
                }
                match engine.search(&keyword, limit, &candidate_tx, &shutdown_rx).await {
                    Ok(totals) => state.with_report(|r| {
                        r.keywords_processed += 1;
                        r.candidates_seen += totals.seen;
                    }),
                    Err(e) => {
                        warn!(keyword = %keyword, "keyword search failed: {e}");
                        state.with_report(|r| r.keywords_processed += 1);
                        state.record_error(e.kind());
                    }
                }
            }
        }
        drop(candidate_tx);

        for handle in metadata_handles {
            let _ = handle.await;
        }
        for handle in download_handles {
            let _ = handle.await;
        }

        if self.config.download {
            let downloader =
                StreamDownloader::new(self.api.clone(), self.config.downloader.clone());
            if let Err(e) = downloader.cleanup_stale_parts().await {
                warn!("stale part cleanup failed: {e}");
            }
        }

        if state.breaker.tripped() {
            state.record_error(ErrorKind::RemoteError);
        }

        let report = state
            .report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        info!(
            keywords = report.keywords_processed,
            candidates = report.candidates_seen,
            metadata = report.metadata_committed,
            downloads = report.downloads_committed,
            skipped_by_duration = report.downloads_skipped_by_duration,
            errors = report.total_errors(),
            "run finished"
        );

        let fatal = state.fatal.lock().ok().and_then(|mut f| f.take());
        match fatal {
            Some(e) => {
                error!("run aborted: {e}");
                Err(e)
            }
            None => Ok(report),
        }
    }

    /// Queue downloads for items whose metadata survived a previous run
    /// but whose media artifact is missing.
    async fn seed_missing_media(
        &self,
        ready_tx: &mpsc::Sender<ReadyItem>,
        state: &Arc<RunState>,
    ) {
        let missing = match self.store.missing_media_ids().await {
            Ok(missing) => missing,
            Err(e) => {
                warn!("missing-media scan failed: {e}");
                return;
            }
        };
        if missing.is_empty() {
            return;
        }
        info!(count = missing.len(), "re-queueing items with missing media");

        for id in missing {
            let record = match self.store.get(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(video_id = %id, "unreadable metadata during reseed: {e}");
                    continue;
                }
            };
            if exceeds_download_limit(&self.config, &record) {
                state.with_report(|r| r.downloads_skipped_by_duration += 1);
                continue;
            }
            let item = ReadyItem {
                cid: first_cid(&record),
                id,
            };
            if ready_tx.send(item).await.is_err() {
                break;
            }
        }
    }
}

fn first_cid(record: &MetadataRecord) -> u64 {
    record.pages.first().map(|p| p.cid).unwrap_or(0)
}

/// Pre-download duration filter; a missing limit filters nothing.
fn exceeds_download_limit(config: &CrawlerConfig, record: &MetadataRecord) -> bool {
    match config.max_duration_on_download {
        Some(max) => record.duration() > max,
        None => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn metadata_worker(
    worker: usize,
    candidate_rx: Arc<AsyncMutex<mpsc::Receiver<Candidate>>>,
    ready_tx: mpsc::Sender<ReadyItem>,
    collector: Arc<MetadataCollector>,
    store: Arc<DatasetStore>,
    session: Arc<SessionManager>,
    config: CrawlerConfig,
    state: Arc<RunState>,
    shutdown: watch::Sender<bool>,
) {
    let shutdown_rx = shutdown.subscribe();

    loop {
        if *shutdown_rx.borrow() || state.is_fatal() {
            break;
        }
        if state.breaker.tripped() {
            warn!(worker, "metadata stage halted by circuit breaker");
            break;
        }

        let candidate = {
            let mut rx = candidate_rx.lock().await;
            rx.recv().await
        };
        let Some(candidate) = candidate else { break };
        let id = candidate.id.clone();

        // Resume: a complete pair is skipped outright; committed metadata
        // without media goes straight to the download stage.
        if config.resume && store.has_metadata(&id).await {
            if store.has_media(&id).await {
                continue;
            }
            if let Ok(Some(record)) = store.get(&id).await {
                forward_download(&config, &ready_tx, &state, &record).await;
                continue;
            }
        }

        let result = collect_with_reauth(&collector, &session, &state, &id).await;
        match result {
            Ok(record) => {
                state.breaker.record(false);
                state.with_report(|r| r.metadata_committed += 1);

                let committed = state.committed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(max) = config.max_items {
                    if committed >= max {
                        info!(max, "global item cap reached, stopping intake");
                        let _ = shutdown.send(true);
                    }
                }

                forward_download(&config, &ready_tx, &state, &record).await;
            }
            Err(e) => {
                let kind = e.kind();
                state.breaker.record(kind == ErrorKind::RemoteError);
                if e.is_fatal() || kind == ErrorKind::AuthExpired {
                    state.set_fatal(e);
                    let _ = shutdown.send(true);
                    break;
                }
                if kind == ErrorKind::NotFound {
                    // Skipped, not an error at the run level.
                    tracing::debug!(video_id = %id, "item gone from remote, skipped");
                    continue;
                }
                warn!(video_id = %id, "metadata collection failed: {e}");
                state.record_error(kind);
            }
        }
    }
}

/// Collect once, allowing a single session refresh per run when the
/// remote reports the session expired.
async fn collect_with_reauth(
    collector: &MetadataCollector,
    session: &SessionManager,
    state: &RunState,
    id: &VideoId,
) -> CrawlerResult<MetadataRecord> {
    match collector.collect(id).await {
        Err(CrawlerError::Client(ClientError::AuthExpired)) => {
            if state.reauth_used.swap(true, Ordering::SeqCst) {
                // Second expiry in one run: give up.
                return Err(CrawlerError::Client(ClientError::AuthExpired));
            }
            warn!(video_id = %id, "session expired, attempting one re-login");
            session.login(true).await?;
            collector.collect(id).await
        }
        other => other,
    }
}

async fn forward_download(
    config: &CrawlerConfig,
    ready_tx: &mpsc::Sender<ReadyItem>,
    state: &RunState,
    record: &MetadataRecord,
) {
    if !config.download {
        return;
    }
    if exceeds_download_limit(config, record) {
        info!(
            video_id = %record.id(),
            duration = record.duration(),
            "skipping download: over the duration limit"
        );
        state.with_report(|r| r.downloads_skipped_by_duration += 1);
        return;
    }
    let item = ReadyItem {
        id: record.id().clone(),
        cid: first_cid(record),
    };
    let _ = ready_tx.send(item).await;
}

async fn download_worker(
    worker: usize,
    ready_rx: Arc<AsyncMutex<mpsc::Receiver<ReadyItem>>>,
    downloader: StreamDownloader,
    store: Arc<DatasetStore>,
    state: Arc<RunState>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() || state.disk_full.load(Ordering::SeqCst) {
            break;
        }

        let item = {
            let mut rx = ready_rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else { break };

        let dataset_size = store.dataset_size_bytes().await;
        match downloader.download(&item.id, item.cid, dataset_size).await {
            Ok(outcome) => {
                let ext = outcome
                    .path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("mp4")
                    .to_string();
                match store.attach_media(&item.id, &ext).await {
                    Ok(()) => state.with_report(|r| r.downloads_committed += 1),
                    Err(e) => {
                        warn!(video_id = %item.id, "media commit failed: {e}");
                        state.record_error(e.kind());
                    }
                }
            }
            Err(biliset_media::MediaError::Cancelled) => break,
            Err(e) => {
                let kind = e.kind();
                match kind {
                    ErrorKind::DiskFull => {
                        error!(worker, "disk guard fired, halting downloads: {e}");
                        state.disk_full.store(true, Ordering::SeqCst);
                        state.record_error(kind);
                        break;
                    }
                    _ => {
                        warn!(video_id = %item.id, "download failed: {e}");
                        state.record_error(kind);
                    }
                }
            }
        }
    }
}
