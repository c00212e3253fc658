//! On-disk layout for job media files.
//!
//! The store owns no job state: it only knows how part, manifest and output
//! files are named under the two media directories, prepares those directories
//! at startup and provides the stale-output sweep primitive.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::Result;

/// Path and naming authority for uploaded parts, concat manifests and
/// assembled outputs.
#[derive(Debug)]
pub struct PartStore {
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl PartStore {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Path of one uploaded input part. Part indices are zero-padded to two
    /// digits so listings sort in concat order.
    pub fn part_path(&self, job_id: &str, part: u32) -> PathBuf {
        self.input_dir.join(format!("{job_id}-part{part:02}.mp4"))
    }

    /// All input-part paths of a job in index order.
    pub fn part_paths(&self, job_id: &str, part_count: u32) -> Vec<PathBuf> {
        (0..part_count)
            .map(|part| self.part_path(job_id, part))
            .collect()
    }

    /// Path of the concat-demuxer manifest for a job, kept beside the parts.
    pub fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.input_dir.join(format!("{job_id}-manifest.txt"))
    }

    /// Path of the assembled output file.
    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(format!("{job_id}-output.mp4"))
    }

    /// Create both media directories and clear any files left over from a
    /// previous run. Called once before the server starts accepting uploads.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.input_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let inputs = clear_dir(&self.input_dir).await?;
        let outputs = clear_dir(&self.output_dir).await?;
        debug!(inputs, outputs, "cleared media directories");
        Ok(())
    }

    /// Clear all output files, used at shutdown.
    pub async fn clear_outputs(&self) -> Result<u64> {
        clear_dir(&self.output_dir).await
    }

    /// Best-effort removal of everything a job may have written: input parts,
    /// the manifest and the output file. Missing files are not an error.
    pub async fn remove_job_files(&self, job_id: &str, part_count: u32) {
        let mut paths = self.part_paths(job_id, part_count);
        paths.push(self.manifest_path(job_id));
        paths.push(self.output_path(job_id));
        for path in paths {
            remove_quietly(&path).await;
        }
    }

    /// Remove output files whose modification time is older than `retention`.
    /// Returns the number of files removed; unreadable entries are skipped
    /// with a warning.
    pub async fn sweep_outputs(&self, retention: Duration) -> Result<u64> {
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            let stale = match age {
                Some(age) => age > retention,
                // Unknown mtime: leave the file alone rather than guess.
                None => false,
            };
            if !stale {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "swept stale output");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to sweep output");
                }
            }
        }

        Ok(removed)
    }
}

/// Remove one file, tolerating its absence.
pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed job file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to remove job file");
        }
    }
}

/// Remove every plain file directly inside `dir`, leaving subdirectories
/// untouched. Returns the number of files removed.
async fn clear_dir(dir: &Path) -> Result<u64> {
    let mut removed = 0u64;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to clear file");
                }
            },
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to inspect entry");
            }
        }
    }
    Ok(removed)
}
