//! Filesystem helpers for media artifacts.

use std::path::Path;

use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Move a file into place, handling cross-device moves.
///
/// Attempts a fast rename first; on EXDEV falls back to copying to a
/// temporary sibling of the destination and renaming, so the destination
/// only ever appears complete.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => copy_and_delete(src, dst).await,
        Err(e) => Err(MediaError::from(e)),
    }
}

/// Check if an IO error is EXDEV (cross-device link).
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> MediaResult<()> {
    let tmp_dst = dst.with_extension("tmp");

    fs::copy(src, &tmp_dst).await?;
    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(MediaError::from(e));
    }

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(
            "failed to remove source after cross-device move: {}: {e}",
            src.display()
        );
    }
    Ok(())
}

/// Best-effort removal of a set of temporary files.
pub async fn remove_files(paths: &[&Path]) {
    for path in paths {
        if path.exists() {
            if let Err(e) = fs::remove_file(path).await {
                tracing::warn!("failed to remove temp file {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_move_file_same_filesystem() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.bin");
        let dst = dir.path().join("dest.bin");

        fs::write(&src, b"payload").await.unwrap();
        move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_file_creates_parent() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.bin");
        let dst = dir.path().join("sub").join("dest.bin");

        fs::write(&src, b"x").await.unwrap();
        move_file(&src, &dst).await.unwrap();
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_remove_files_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present");
        let absent = dir.path().join("absent");
        fs::write(&present, b"x").await.unwrap();

        remove_files(&[present.as_path(), absent.as_path()]).await;
        assert!(!present.exists());
    }
}
