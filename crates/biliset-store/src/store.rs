//! The dataset store: artifact commits and the index document.

use std::path::Path;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use biliset_models::{IndexDocument, IndexEntry, MetadataRecord, RemovalReport, VideoId};

use crate::error::{StoreError, StoreResult};
use crate::layout::{atomic_write_json, DatasetLayout};

/// Whether `put_metadata` wrote a fresh record or replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
}

/// Exclusive owner of the on-disk dataset.
///
/// The index lives in memory behind a writer lock and is persisted
/// atomically after every mutation. If the persist fails, the in-memory
/// copy is rolled back to its prior snapshot and `CommitFailed` surfaces;
/// on-disk artifacts written earlier in the commit remain as orphans for
/// maintenance to reconcile.
pub struct DatasetStore {
    layout: DatasetLayout,
    index: RwLock<IndexDocument>,
    update_index_on_save: bool,
}

impl DatasetStore {
    /// Open the dataset, creating directories and loading (or initializing)
    /// the index document.
    pub async fn open(layout: DatasetLayout, update_index_on_save: bool) -> StoreResult<Self> {
        layout.ensure_dirs()?;
        let index = Self::load_index_from(&layout.index_file)?;
        info!(
            entries = index.len(),
            index = %layout.index_file.display(),
            "dataset opened"
        );
        Ok(Self {
            layout,
            index: RwLock::new(index),
            update_index_on_save,
        })
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Write the metadata file and update its index entry in one commit.
    pub async fn put_metadata(&self, record: &MetadataRecord) -> StoreResult<PutOutcome> {
        let id = record.id().clone();
        let path = self.layout.metadata_path(&id);
        let existed = path.exists();

        atomic_write_json(&path, &serde_json::to_value(record)?)?;
        debug!(video_id = %id, "metadata file written");

        if self.update_index_on_save {
            let mut index = self.index.write().await;
            let snapshot = index.clone();

            let mut entry = IndexEntry::from_record(record);
            // Re-crawling an item with media attached must not lose the
            // attachment flag.
            if let Some(existing) = index.get(&id) {
                entry.has_media = existing.has_media;
                entry.media_ext = existing.media_ext.clone();
            }
            index.upsert(entry);
            self.persist_index(&mut index, snapshot)?;
        }

        Ok(if existed {
            PutOutcome::Updated
        } else {
            PutOutcome::Created
        })
    }

    /// Record the existence of `media/<id>.<ext>` in the index entry.
    pub async fn attach_media(&self, id: &VideoId, ext: &str) -> StoreResult<()> {
        let metadata_path = self.layout.metadata_path(id);
        if !metadata_path.exists() {
            return Err(StoreError::MetadataMissing(id.clone()));
        }

        let mut index = self.index.write().await;
        let snapshot = index.clone();

        let mut entry = match index.get(id) {
            Some(entry) => entry.clone(),
            // Inline index updates may be disabled; derive the entry from
            // the metadata file instead.
            None => {
                let record = self.read_record(&metadata_path)?;
                IndexEntry::from_record(&record)
            }
        };
        entry.has_media = true;
        entry.media_ext = Some(ext.to_string());
        index.upsert(entry);

        self.persist_index(&mut index, snapshot)?;
        debug!(video_id = %id, ext, "media artifact attached");
        Ok(())
    }

    /// Load the metadata record of an id, if its file exists and parses.
    pub async fn get(&self, id: &VideoId) -> StoreResult<Option<MetadataRecord>> {
        let path = self.layout.metadata_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_record(&path)?))
    }

    pub async fn has_metadata(&self, id: &VideoId) -> bool {
        self.layout.metadata_path(id).exists()
    }

    pub async fn has_media(&self, id: &VideoId) -> bool {
        self.layout.find_media(id).is_some()
    }

    /// Both artifacts on disk.
    pub async fn is_complete_pair(&self, id: &VideoId) -> bool {
        self.has_metadata(id).await && self.has_media(id).await
    }

    /// Delete metadata file, media file and index entry for each id.
    /// Missing artifacts are reported, never fatal.
    pub async fn remove(&self, ids: &[VideoId]) -> StoreResult<RemovalReport> {
        let mut report = RemovalReport::default();
        let mut index = self.index.write().await;
        let snapshot = index.clone();

        for id in ids {
            // Media first: a crash mid-removal leaves a metadata-only
            // orphan, which sync_index can heal.
            match self.layout.find_media(id) {
                Some((path, _)) => {
                    report.bytes_freed += file_size(&path);
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(video_id = %id, "failed to delete media file: {e}");
                    }
                }
                None => report.missing_media.push(id.clone()),
            }

            let metadata_path = self.layout.metadata_path(id);
            if metadata_path.exists() {
                report.bytes_freed += file_size(&metadata_path);
                if let Err(e) = std::fs::remove_file(&metadata_path) {
                    warn!(video_id = %id, "failed to delete metadata file: {e}");
                }
            } else {
                report.missing_metadata.push(id.clone());
            }

            if index.remove(id).is_some() {
                report.removed.push(id.clone());
            }
        }

        self.persist_index(&mut index, snapshot)?;
        info!(
            removed = report.removed.len(),
            bytes_freed = report.bytes_freed,
            "items removed from dataset"
        );
        Ok(report)
    }

    /// A point-in-time copy of the index document.
    pub async fn snapshot_index(&self) -> IndexDocument {
        self.index.read().await.clone()
    }

    /// Re-read the index document from disk, replacing the in-memory copy.
    pub async fn load_index(&self) -> StoreResult<IndexDocument> {
        let loaded = Self::load_index_from(&self.layout.index_file)?;
        let mut index = self.index.write().await;
        *index = loaded.clone();
        Ok(loaded)
    }

    /// Ids with a metadata file but no media artifact, in id order.
    /// These feed the re-download pass on resume.
    pub async fn missing_media_ids(&self) -> StoreResult<Vec<VideoId>> {
        let metadata = self.layout.metadata_ids()?;
        let media = self.layout.media_ids()?;
        Ok(metadata.difference(&media).cloned().collect())
    }

    pub async fn dataset_size_bytes(&self) -> u64 {
        self.layout.dataset_size_bytes()
    }

    /// Run an arbitrary edit on the index under the writer lock, with the
    /// same persist-or-rollback contract as the commit operations.
    /// Used by the maintenance engine.
    pub(crate) async fn edit_index<F>(&self, edit: F) -> StoreResult<()>
    where
        F: FnOnce(&mut IndexDocument),
    {
        let mut index = self.index.write().await;
        let snapshot = index.clone();
        edit(&mut index);
        index.recompute_stats();
        self.persist_index(&mut index, snapshot)
    }

    fn read_record(&self, path: &Path) -> StoreResult<MetadataRecord> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Persist the index atomically; on failure restore the prior
    /// in-memory snapshot and surface `CommitFailed`.
    fn persist_index(
        &self,
        index: &mut IndexDocument,
        snapshot: IndexDocument,
    ) -> StoreResult<()> {
        let value = match serde_json::to_value(&*index) {
            Ok(value) => value,
            Err(e) => {
                *index = snapshot;
                return Err(StoreError::commit_failed(e.to_string()));
            }
        };
        if let Err(e) = atomic_write_json(&self.layout.index_file, &value) {
            *index = snapshot;
            return Err(StoreError::commit_failed(e.to_string()));
        }
        Ok(())
    }

    fn load_index_from(path: &Path) -> StoreResult<IndexDocument> {
        if !path.exists() {
            return Ok(IndexDocument::new("biliset"));
        }
        let raw = std::fs::read_to_string(path)?;
        match serde_json::from_str(&raw) {
            Ok(index) => Ok(index),
            Err(e) => {
                warn!("index document unreadable, starting empty: {e}");
                Ok(IndexDocument::new("biliset"))
            }
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use biliset_models::{BasicInfo, CrawlInfo, Owner, PageInfo, StatCounts};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str, duration: u64) -> MetadataRecord {
        MetadataRecord {
            basic_info: BasicInfo {
                bvid: VideoId::parse(id).unwrap(),
                aid: 1,
                title: format!("video {id}"),
                desc: String::new(),
                duration,
                pubdate: 1_700_000_000,
                pic: String::new(),
            },
            owner: Owner {
                mid: 7,
                name: "uploader".to_string(),
                face: String::new(),
            },
            stat: StatCounts {
                view: 100,
                like: 10,
                ..Default::default()
            },
            pages: vec![PageInfo {
                cid: 1,
                page: 1,
                part: String::new(),
                duration,
            }],
            tags: vec!["tag".to_string()],
            crawl_info: CrawlInfo {
                crawled_at: Utc::now(),
                schema_version: 1,
            },
        }
    }

    async fn open_store(dir: &TempDir) -> DatasetStore {
        DatasetStore::open(DatasetLayout::from_root(dir.path()), true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_metadata_created_then_updated() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let r1 = record("BV1aaa0000aa", 30);
        assert_eq!(store.put_metadata(&r1).await.unwrap(), PutOutcome::Created);

        let mut r2 = r1.clone();
        r2.basic_info.title = "replaced".to_string();
        assert_eq!(store.put_metadata(&r2).await.unwrap(), PutOutcome::Updated);

        // Exactly one metadata file, and get() returns the second record.
        assert_eq!(store.layout().metadata_ids().unwrap().len(), 1);
        let loaded = store.get(r1.id()).await.unwrap().unwrap();
        assert_eq!(loaded.basic_info.title, "replaced");

        // Index holds a single entry with consistent stats.
        let index = store.snapshot_index().await;
        assert_eq!(index.stats.total_count, 1);
        assert_eq!(index.stats.total_duration, 30);
    }

    #[tokio::test]
    async fn test_index_duration_matches_metadata_after_commit() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let r = record("BV1aaa0000aa", 45);
        store.put_metadata(&r).await.unwrap();

        let index = store.snapshot_index().await;
        let entry = index.get(r.id()).unwrap();
        assert_eq!(entry.duration, store.get(r.id()).await.unwrap().unwrap().duration());
    }

    #[tokio::test]
    async fn test_attach_media_requires_metadata() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = VideoId::parse("BV1aaa0000aa").unwrap();

        let err = store.attach_media(&id, "mp4").await.unwrap_err();
        assert!(matches!(err, StoreError::MetadataMissing(_)));
    }

    #[tokio::test]
    async fn test_attach_media_sets_flag_and_survives_recrawl() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let r = record("BV1aaa0000aa", 30);
        store.put_metadata(&r).await.unwrap();
        std::fs::write(store.layout().media_path(r.id(), "mp4"), b"media").unwrap();

        store.attach_media(r.id(), "mp4").await.unwrap();
        let index = store.snapshot_index().await;
        assert!(index.get(r.id()).unwrap().has_media);

        // Re-crawl overwrites metadata; the attachment flag must survive.
        store.put_metadata(&r).await.unwrap();
        let index = store.snapshot_index().await;
        let entry = index.get(r.id()).unwrap();
        assert!(entry.has_media);
        assert_eq!(entry.media_ext.as_deref(), Some("mp4"));
    }

    #[tokio::test]
    async fn test_remove_reports_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let with_media = record("BV1aaa0000aa", 30);
        store.put_metadata(&with_media).await.unwrap();
        std::fs::write(store.layout().media_path(with_media.id(), "mp4"), b"m").unwrap();

        let metadata_only = record("BV1bbb0000bb", 20);
        store.put_metadata(&metadata_only).await.unwrap();

        let ghost = VideoId::parse("BV1ccc0000cc").unwrap();

        let report = store
            .remove(&[
                with_media.id().clone(),
                metadata_only.id().clone(),
                ghost.clone(),
            ])
            .await
            .unwrap();

        assert_eq!(report.removed.len(), 2);
        assert!(report.missing_media.contains(metadata_only.id()));
        assert!(report.missing_media.contains(&ghost));
        assert!(report.missing_metadata.contains(&ghost));
        assert!(report.bytes_freed > 0);

        assert!(store.snapshot_index().await.is_empty());
        assert!(store.layout().metadata_ids().unwrap().is_empty());
        assert!(store.layout().media_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            store.put_metadata(&record("BV1aaa0000aa", 30)).await.unwrap();
        }
        // A second store instance sees the committed index.
        let store = open_store(&dir).await;
        let index = store.snapshot_index().await;
        assert_eq!(index.stats.total_count, 1);
        assert!(index.contains(&VideoId::parse("BV1aaa0000aa").unwrap()));
    }

    #[tokio::test]
    async fn test_missing_media_ids() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let complete = record("BV1aaa0000aa", 30);
        store.put_metadata(&complete).await.unwrap();
        std::fs::write(store.layout().media_path(complete.id(), "mp4"), b"m").unwrap();

        let partial = record("BV1bbb0000bb", 20);
        store.put_metadata(&partial).await.unwrap();

        let missing = store.missing_media_ids().await.unwrap();
        assert_eq!(missing, vec![partial.id().clone()]);
    }

    #[tokio::test]
    async fn test_corrupt_index_starts_empty() {
        let dir = TempDir::new().unwrap();
        let layout = DatasetLayout::from_root(dir.path());
        layout.ensure_dirs().unwrap();
        std::fs::write(&layout.index_file, "{{{not json").unwrap();

        let store = DatasetStore::open(layout, true).await.unwrap();
        assert!(store.snapshot_index().await.is_empty());
    }
}
