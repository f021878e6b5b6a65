//! Filesystem layout of the dataset.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use biliset_models::VideoId;

/// Name of the index document inside the metadata directory.
pub const INDEX_FILENAME: &str = "index.json";

/// Paths of the three artifact families:
///
/// ```text
/// <root>/metadata/<id>.json
/// <root>/media/<id>.<ext>
/// <root>/metadata/index.json
/// ```
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub metadata_dir: PathBuf,
    pub media_dir: PathBuf,
    pub index_file: PathBuf,
}

impl DatasetLayout {
    pub fn new(
        metadata_dir: impl Into<PathBuf>,
        media_dir: impl Into<PathBuf>,
        index_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            media_dir: media_dir.into(),
            index_file: index_file.into(),
        }
    }

    /// Conventional layout under one dataset root.
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let metadata_dir = root.join("metadata");
        Self {
            index_file: metadata_dir.join(INDEX_FILENAME),
            media_dir: root.join("media"),
            metadata_dir,
        }
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.metadata_dir)?;
        std::fs::create_dir_all(&self.media_dir)?;
        Ok(())
    }

    pub fn metadata_path(&self, id: &VideoId) -> PathBuf {
        self.metadata_dir.join(id.metadata_filename())
    }

    pub fn media_path(&self, id: &VideoId, ext: &str) -> PathBuf {
        self.media_dir.join(id.media_filename(ext))
    }

    /// Locate the media artifact of an id regardless of container
    /// extension. `.part` and `.tmp` temporaries never match because their
    /// stems carry an extra dot.
    pub fn find_media(&self, id: &VideoId) -> Option<(PathBuf, String)> {
        let entries = std::fs::read_dir(&self.media_dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            let stem = path.file_stem().and_then(|s| s.to_str());
            if stem != Some(id.as_str()) {
                continue;
            }
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if ext != "part" && ext != "tmp" {
                    return Some((path.clone(), ext.to_string()));
                }
            }
        }
        None
    }

    /// Ids that have a metadata file.
    pub fn metadata_ids(&self) -> io::Result<BTreeSet<VideoId>> {
        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(&self.metadata_dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "index" {
                continue;
            }
            if let Ok(id) = VideoId::parse(stem) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Ids that have a media artifact.
    pub fn media_ids(&self) -> io::Result<BTreeSet<VideoId>> {
        let mut ids = BTreeSet::new();
        if !self.media_dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.media_dir)?.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("part") | Some("tmp") | None) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = VideoId::parse(stem) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Total size of all media artifacts in bytes.
    pub fn dataset_size_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.media_dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| {
                let path = e.path();
                !matches!(
                    path.extension().and_then(|x| x.to_str()),
                    Some("part") | Some("tmp")
                )
            })
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

/// Write a JSON document atomically: serialize into a temporary sibling,
/// fsync it, rename over the destination, fsync the directory. A concurrent
/// reader observes either the old or the new complete document.
pub fn atomic_write_json(path: &Path, value: &Value) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    std::fs::create_dir_all(parent)?;

    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    {
        use io::Write;
        let mut file = File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, path)?;

    // Persist the rename itself.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    debug!(path = %path.display(), "document written atomically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> DatasetLayout {
        let layout = DatasetLayout::from_root(dir.path());
        layout.ensure_dirs().unwrap();
        layout
    }

    #[test]
    fn test_from_root_shape() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        assert_eq!(layout.index_file, dir.path().join("metadata/index.json"));
        assert!(layout.metadata_dir.is_dir());
        assert!(layout.media_dir.is_dir());
    }

    #[test]
    fn test_artifact_id_scans_skip_temporaries_and_index() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);

        std::fs::write(layout.metadata_dir.join("BV1aaa0000aa.json"), "{}").unwrap();
        std::fs::write(layout.metadata_dir.join("index.json"), "{}").unwrap();
        std::fs::write(layout.metadata_dir.join("notes.txt"), "x").unwrap();

        std::fs::write(layout.media_dir.join("BV1aaa0000aa.mp4"), "v").unwrap();
        std::fs::write(layout.media_dir.join("BV1bbb0000bb.video.part"), "p").unwrap();
        std::fs::write(layout.media_dir.join("BV1ccc0000cc.json.tmp"), "t").unwrap();

        let metadata = layout.metadata_ids().unwrap();
        assert_eq!(metadata.len(), 1);
        assert!(metadata.contains(&VideoId::from_trusted("BV1aaa0000aa")));

        let media = layout.media_ids().unwrap();
        assert_eq!(media.len(), 1);
        assert!(media.contains(&VideoId::from_trusted("BV1aaa0000aa")));
    }

    #[test]
    fn test_find_media_matches_any_container() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let id = VideoId::from_trusted("BV1aaa0000aa");

        assert!(layout.find_media(&id).is_none());
        std::fs::write(layout.media_dir.join("BV1aaa0000aa.flv"), "v").unwrap();
        let (path, ext) = layout.find_media(&id).unwrap();
        assert_eq!(ext, "flv");
        assert!(path.ends_with("BV1aaa0000aa.flv"));
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");

        atomic_write_json(&path, &serde_json::json!({"v": 1})).unwrap();
        atomic_write_json(&path, &serde_json::json!({"v": 2})).unwrap();

        let value: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["v"], 2);
        // No temporary left behind.
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn test_dataset_size_ignores_temporaries() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        std::fs::write(layout.media_dir.join("BV1aaa0000aa.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(layout.media_dir.join("BV1bbb0000bb.video.part"), vec![0u8; 50]).unwrap();
        assert_eq!(layout.dataset_size_bytes(), 100);
    }
}
