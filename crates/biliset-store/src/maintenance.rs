//! Offline maintenance: duration filtering, orphan analysis, index sync.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use biliset_media::probe_duration;
use biliset_models::{
    CleanReport, FilterReport, IndexEntry, MatchReport, PlannedRemoval, SyncReport, VideoId,
};

use crate::error::StoreResult;
use crate::store::DatasetStore;

/// Offline operations over the dataset store. Never touches the network.
///
/// Every operation supports dry-run: the plan is computed and reported but
/// the filesystem stays untouched. All mutations are idempotent, so a
/// crashed run is healed by simply running the operation again.
pub struct MaintenanceEngine {
    store: Arc<DatasetStore>,
}

impl MaintenanceEngine {
    pub fn new(store: Arc<DatasetStore>) -> Self {
        Self { store }
    }

    /// Compute the four orphan categories.
    pub async fn analyze(&self) -> StoreResult<MatchReport> {
        let layout = self.store.layout();
        let metadata = layout.metadata_ids()?;
        let media = layout.media_ids()?;
        let index: BTreeSet<VideoId> = self
            .store
            .snapshot_index()
            .await
            .videos
            .keys()
            .cloned()
            .collect();

        let matched: BTreeSet<VideoId> = metadata.intersection(&media).cloned().collect();
        let any_artifact: BTreeSet<VideoId> = metadata.union(&media).cloned().collect();

        let report = MatchReport {
            metadata_total: metadata.len() as u64,
            media_total: media.len() as u64,
            index_total: index.len() as u64,
            matched_pairs: matched.len() as u64,
            metadata_only: metadata.difference(&media).cloned().collect(),
            media_only: media.difference(&metadata).cloned().collect(),
            index_only: index.difference(&any_artifact).cloned().collect(),
            missing_from_index: matched.difference(&index).cloned().collect(),
        };

        info!(
            matched = report.matched_pairs,
            metadata_only = report.metadata_only.len(),
            media_only = report.media_only.len(),
            index_only = report.index_only.len(),
            missing_from_index = report.missing_from_index.len(),
            "dataset analyzed"
        );
        Ok(report)
    }

    /// Reconcile the index with the filesystem: after a non-dry run the
    /// index key set equals the set of complete pairs exactly.
    pub async fn sync_index(&self, dry_run: bool) -> StoreResult<SyncReport> {
        let layout = self.store.layout();
        let metadata = layout.metadata_ids()?;
        let media = layout.media_ids()?;
        let matched: BTreeSet<VideoId> = metadata.intersection(&media).cloned().collect();

        let index = self.store.snapshot_index().await;
        let index_ids: BTreeSet<VideoId> = index.videos.keys().cloned().collect();

        let removed: Vec<VideoId> = index_ids.difference(&matched).cloned().collect();
        let added: Vec<VideoId> = matched.difference(&index_ids).cloned().collect();

        let report = SyncReport {
            dry_run,
            removed,
            added,
        };

        if dry_run || report.is_noop() {
            info!(
                dry_run,
                removed = report.removed_count(),
                added = report.added_count(),
                "index sync computed"
            );
            return Ok(report);
        }

        // Project the entries to add before taking the writer lock.
        let mut new_entries = Vec::new();
        for id in &report.added {
            match self.store.get(id).await {
                Ok(Some(record)) => {
                    let mut entry = IndexEntry::from_record(&record);
                    entry.has_media = true;
                    entry.media_ext = layout.find_media(id).map(|(_, ext)| ext);
                    new_entries.push(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(video_id = %id, "metadata file unreadable, not indexed: {e}");
                }
            }
        }

        let to_remove = report.removed.clone();
        self.store
            .edit_index(move |index| {
                for id in &to_remove {
                    index.remove(id);
                }
                for entry in new_entries {
                    index.upsert(entry);
                }
            })
            .await?;

        info!(
            removed = report.removed_count(),
            added = report.added_count(),
            "index synchronized"
        );
        Ok(report)
    }

    /// Delete orphaned artifacts by category.
    pub async fn clean(
        &self,
        clean_media_orphans: bool,
        clean_metadata_orphans: bool,
        update_index: bool,
        dry_run: bool,
    ) -> StoreResult<CleanReport> {
        let analysis = self.analyze().await?;
        let layout = self.store.layout();

        let mut report = CleanReport {
            dry_run,
            ..Default::default()
        };

        if clean_media_orphans {
            for id in &analysis.media_only {
                if let Some((path, _)) = layout.find_media(id) {
                    if !dry_run {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(video_id = %id, "failed to delete orphan media: {e}");
                            continue;
                        }
                    }
                    report.cleaned_media.push(id.clone());
                }
            }
        }

        if clean_metadata_orphans {
            for id in &analysis.metadata_only {
                let path = layout.metadata_path(id);
                if path.exists() {
                    if !dry_run {
                        if let Err(e) = std::fs::remove_file(&path) {
                            warn!(video_id = %id, "failed to delete orphan metadata: {e}");
                            continue;
                        }
                    }
                    report.cleaned_metadata.push(id.clone());
                }
            }
        }

        if update_index {
            report.index_sync = Some(self.sync_index(dry_run).await?);
        }

        info!(
            dry_run,
            media = report.cleaned_media.len(),
            metadata = report.cleaned_metadata.len(),
            "orphan clean finished"
        );
        Ok(report)
    }

    /// Plan (and unless `dry_run`, execute) removal of every item whose
    /// duration exceeds `max_seconds`.
    ///
    /// Duration source preference: the metadata record's own duration
    /// field, then an external probe of the media file. Items whose
    /// duration cannot be determined are listed but never removed.
    pub async fn filter_by_duration(
        &self,
        max_seconds: u64,
        dry_run: bool,
    ) -> StoreResult<FilterReport> {
        let layout = self.store.layout();
        let mut report = FilterReport {
            dry_run,
            ..Default::default()
        };

        for id in layout.metadata_ids()? {
            report.scanned += 1;

            let from_metadata = match self.store.get(&id).await {
                Ok(Some(record)) if record.duration() > 0 => Some(record.duration()),
                Ok(_) => None,
                Err(e) => {
                    warn!(video_id = %id, "metadata unreadable while filtering: {e}");
                    None
                }
            };

            let duration = match from_metadata {
                Some(d) => Some(d),
                None => match layout.find_media(&id) {
                    Some((path, _)) => match probe_duration(&path).await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(video_id = %id, "media probe failed: {e}");
                            None
                        }
                    },
                    None => None,
                },
            };

            match duration {
                Some(d) if d > max_seconds => {
                    report.planned.push(PlannedRemoval { id, duration: d })
                }
                Some(_) => {}
                None => report.undetermined.push(id),
            }
        }

        info!(
            dry_run,
            scanned = report.scanned,
            over_limit = report.planned.len(),
            undetermined = report.undetermined.len(),
            max_seconds,
            "duration filter computed"
        );

        if dry_run || report.planned.is_empty() {
            return Ok(report);
        }

        let ids: Vec<VideoId> = report.planned.iter().map(|p| p.id.clone()).collect();
        let removal = self.store.remove(&ids).await?;
        report.removed_entries = removal.removed.len() as u64;
        report.removed_metadata =
            (ids.len() - removal.missing_metadata.len()) as u64;
        report.removed_media = (ids.len() - removal.missing_media.len()) as u64;
        report.bytes_freed = removal.bytes_freed;

        Ok(report)
    }
}
