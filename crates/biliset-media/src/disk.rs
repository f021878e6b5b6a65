//! Disk capacity guard.

use std::path::Path;

use tracing::warn;

use crate::error::{MediaError, MediaResult};

/// Headroom demanded before a new download starts, in multiples of the
/// configured chunk size. A download whose streams turn out larger still
/// fails cleanly on write; this guard only rejects hopeless starts early.
pub const HEADROOM_CHUNKS: u64 = 64;

const GIB: u64 = 1024 * 1024 * 1024;

/// Verify there is room for another download.
///
/// Fails with [`MediaError::DiskFull`] when either the filesystem holding
/// `media_dir` has less than `chunk_size * HEADROOM_CHUNKS` bytes free, or
/// the dataset has already reached `max_size_gb`.
pub fn ensure_capacity(
    media_dir: &Path,
    chunk_size: u64,
    dataset_size_bytes: u64,
    max_size_gb: Option<u64>,
) -> MediaResult<()> {
    let required = chunk_size.saturating_mul(HEADROOM_CHUNKS);
    let available = fs2::available_space(media_dir)?;
    if available < required {
        warn!(
            available,
            required,
            dir = %media_dir.display(),
            "refusing download: filesystem almost full"
        );
        return Err(MediaError::DiskFull {
            required,
            available,
        });
    }

    if let Some(limit_gb) = max_size_gb {
        let limit = limit_gb.saturating_mul(GIB);
        if dataset_size_bytes >= limit {
            warn!(
                dataset_size_bytes,
                limit, "refusing download: dataset size cap reached"
            );
            return Err(MediaError::DiskFull {
                required,
                available: limit.saturating_sub(dataset_size_bytes),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_capacity_ok_for_tiny_requirement() {
        let dir = TempDir::new().unwrap();
        ensure_capacity(dir.path(), 1, 0, None).unwrap();
    }

    #[test]
    fn test_dataset_cap_rejects() {
        let dir = TempDir::new().unwrap();
        let err = ensure_capacity(dir.path(), 1, 2 * GIB, Some(1)).unwrap_err();
        assert!(matches!(err, MediaError::DiskFull { .. }));
    }

    #[test]
    fn test_dataset_cap_allows_below_limit() {
        let dir = TempDir::new().unwrap();
        ensure_capacity(dir.path(), 1, GIB / 2, Some(1)).unwrap();
    }
}
