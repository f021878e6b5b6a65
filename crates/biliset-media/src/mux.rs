//! External muxer invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// Lines of muxer stderr retained for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Builder for the copy-codec mux of a downloaded video/audio pair.
///
/// Invokes `<tool> -i <video> -i <audio> -c copy <output>`; the streams are
/// already in their final encoding, so no transcoding happens here.
#[derive(Debug, Clone)]
pub struct MuxCommand {
    tool: PathBuf,
    video_input: PathBuf,
    audio_input: PathBuf,
    output: PathBuf,
    timeout_secs: u64,
}

impl MuxCommand {
    pub fn new(
        tool: impl AsRef<Path>,
        video_input: impl AsRef<Path>,
        audio_input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Self {
        Self {
            tool: tool.as_ref().to_path_buf(),
            video_input: video_input.as_ref().to_path_buf(),
            audio_input: audio_input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.video_input.to_string_lossy().to_string(),
            "-i".to_string(),
            self.audio_input.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            self.output.to_string_lossy().to_string(),
        ]
    }

    /// Run the muxer. Exit code 0 means success; anything else surfaces the
    /// captured stderr tail verbatim.
    pub async fn run(&self) -> MediaResult<()> {
        let tool = self.resolve_tool()?;

        if !self.video_input.exists() {
            return Err(MediaError::download_failed(format!(
                "video input missing: {}",
                self.video_input.display()
            )));
        }
        if !self.audio_input.exists() {
            return Err(MediaError::download_failed(format!(
                "audio input missing: {}",
                self.audio_input.display()
            )));
        }

        let args = self.build_args();
        debug!(tool = %tool.display(), "running muxer: {}", args.join(" "));

        let mut child = Command::new(&tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain stderr concurrently so a chatty tool cannot block on a full
        // pipe; only the tail is kept.
        let stderr = child.stderr.take();
        let tail_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail.join("\n")
        });

        let status = match tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            child.wait(),
        )
        .await
        {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    tool = %tool.display(),
                    "muxer timed out after {}s, killing process",
                    self.timeout_secs
                );
                let _ = child.kill().await;
                return Err(MediaError::Timeout(self.timeout_secs));
            }
        };

        let stderr_tail = tail_task.await.unwrap_or_default();

        if !status.success() {
            return Err(MediaError::MergeFailed {
                tool: tool.to_string_lossy().to_string(),
                exit_code: status.code(),
                stderr_tail,
            });
        }

        if !self.output.exists() {
            return Err(MediaError::MergeFailed {
                tool: tool.to_string_lossy().to_string(),
                exit_code: status.code(),
                stderr_tail: "muxer exited 0 but produced no output file".to_string(),
            });
        }

        info!(output = %self.output.display(), "mux complete");
        Ok(())
    }

    /// Locate the configured tool: bare names go through PATH lookup,
    /// explicit paths must exist.
    fn resolve_tool(&self) -> MediaResult<PathBuf> {
        if self.tool.components().count() > 1 {
            if self.tool.exists() {
                return Ok(self.tool.clone());
            }
            return Err(MediaError::MuxerNotFound(
                self.tool.to_string_lossy().to_string(),
            ));
        }
        which::which(&self.tool)
            .map_err(|_| MediaError::MuxerNotFound(self.tool.to_string_lossy().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_copy_codec_shape() {
        let cmd = MuxCommand::new("ffmpeg", "v.video.part", "a.audio.part", "out.mp4");
        let args = cmd.build_args();
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "v.video.part");
        assert_eq!(args[2], "-i");
        assert_eq!(args[3], "a.audio.part");
        assert_eq!(args[4], "-c");
        assert_eq!(args[5], "copy");
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let cmd = MuxCommand::new(
            "/nonexistent/path/to/muxer",
            "v.part",
            "a.part",
            "out.mp4",
        );
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, MediaError::MuxerNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_inputs_are_reported() {
        // `true` exists everywhere and never reads its args.
        let cmd = MuxCommand::new("true", "/no/such/v.part", "/no/such/a.part", "out.mp4");
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(err, MediaError::DownloadFailed(_)));
    }
}
