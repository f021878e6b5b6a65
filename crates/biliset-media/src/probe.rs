//! Media duration probing via ffprobe.

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, MediaResult};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

/// Read a media file's duration in whole seconds using ffprobe.
///
/// Returns `Ok(None)` when the tool ran but reported no duration; errors
/// only on tool absence or execution failure.
pub async fn probe_duration(path: impl AsRef<Path>) -> MediaResult<Option<u64>> {
    let path = path.as_ref();
    let tool = which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)?;

    let output = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        Command::new(&tool)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| MediaError::Timeout(30))??;

    if !output.status.success() {
        return Err(MediaError::probe_failed(format!(
            "ffprobe exited with {:?} for {}",
            output.status.code(),
            path.display()
        )));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
    let duration = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| secs.round() as u64);

    debug!(path = %path.display(), ?duration, "probed media duration");
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_output_parses_duration_string() {
        let parsed: ProbeOutput =
            serde_json::from_str(r#"{"format": {"duration": "42.73", "size": "1000"}}"#).unwrap();
        let duration = parsed
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .map(|secs| secs.round() as u64);
        assert_eq!(duration, Some(43));
    }

    #[test]
    fn test_probe_output_tolerates_missing_format() {
        let parsed: ProbeOutput = serde_json::from_str("{}").unwrap();
        assert!(parsed.format.is_none());
    }
}
