//! ffmpeg invocation for stream-copy concatenation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Result;

/// Builds and spawns the ffmpeg processes that join part files.
///
/// The binary is resolved from `FFMPEG_PATH` (falling back to `ffmpeg` on the
/// search path), so tests can substitute a stub.
pub struct ConcatRunner {
    /// Path to the ffmpeg binary.
    ffmpeg_path: String,
}

impl ConcatRunner {
    /// Create a runner using `FFMPEG_PATH` or plain `ffmpeg`.
    pub fn new() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        }
    }

    /// Create a runner with an explicit binary path.
    pub fn with_ffmpeg_path(path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: path.into(),
        }
    }

    /// Render the concat demuxer manifest: one `file '<path>'` line per part,
    /// in part order. Part paths are generated by the store and never contain
    /// quotes, so no escaping is needed.
    pub fn manifest_contents(parts: &[PathBuf]) -> String {
        let mut contents = String::new();
        for part in parts {
            contents.push_str("file '");
            contents.push_str(&part.to_string_lossy());
            contents.push_str("'\n");
        }
        contents
    }

    /// Build the argument list for one concat run. `-safe 0` permits the
    /// absolute paths the manifest contains; `-c copy` keeps this a pure
    /// container rewrite with no re-encode.
    fn build_args(&self, manifest: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            manifest.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Spawn ffmpeg for one job. stderr is piped so the caller can capture
    /// diagnostics; the child is killed if its handle is dropped.
    pub fn spawn(&self, manifest: &Path, output: &Path) -> Result<Child> {
        let args = self.build_args(manifest, output);
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "spawning concat");

        let child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

impl Default for ConcatRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain a child's stderr into memory on a background task, for logging once
/// the process exits.
pub fn collect_stderr(stderr: Option<ChildStderr>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut collected = Vec::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
        }
        collected
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_shape() {
        let runner = ConcatRunner::with_ffmpeg_path("ffmpeg");
        let args = runner.build_args(
            Path::new("/tmp/in/abc-manifest.txt"),
            Path::new("/tmp/out/abc-output.mp4"),
        );

        assert_eq!(args[0], "-hide_banner");
        assert!(args.contains(&"-y".to_string()));
        assert!(args.contains(&"concat".to_string()));
        assert!(args.contains(&"copy".to_string()));

        // The demuxer must be selected before the manifest input.
        let f = args.iter().position(|a| a == "-f").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(f < i);
        assert_eq!(args[i + 1], "/tmp/in/abc-manifest.txt");

        // `-safe 0` precedes the input as well.
        let safe = args.iter().position(|a| a == "-safe").unwrap();
        assert_eq!(args[safe + 1], "0");
        assert!(safe < i);

        // Output path comes last.
        assert_eq!(args.last().unwrap(), "/tmp/out/abc-output.mp4");
    }

    #[test]
    fn test_manifest_contents_preserves_part_order() {
        let parts = vec![
            PathBuf::from("/in/j-part00.mp4"),
            PathBuf::from("/in/j-part01.mp4"),
            PathBuf::from("/in/j-part02.mp4"),
        ];
        let contents = ConcatRunner::manifest_contents(&parts);
        assert_eq!(
            contents,
            "file '/in/j-part00.mp4'\nfile '/in/j-part01.mp4'\nfile '/in/j-part02.mp4'\n"
        );
    }

    #[test]
    fn test_manifest_contents_empty() {
        assert_eq!(ConcatRunner::manifest_contents(&[]), "");
    }

    #[tokio::test]
    async fn test_collect_stderr_without_handle() {
        let lines = collect_stderr(None).await.unwrap();
        assert!(lines.is_empty());
    }
}
