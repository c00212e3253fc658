//! Render dispatcher: moves ready jobs into concurrent ffmpeg concat runs.
//!
//! A single loop owns all scheduling decisions. It scans the registry on a
//! fixed tick, spawns one render task per selected job, and is the only place
//! process exits are turned into job outcomes, so ordering between dispatch,
//! cancellation and completion is never ambiguous.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::{JobRegistry, RenderOrder};
use crate::storage::{self, PartStore};

pub mod concat;

pub use concat::ConcatRunner;

/// Configuration for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent ffmpeg processes.
    pub max_concurrency: usize,
    /// How often the registry is scanned for ready jobs.
    pub tick_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of one render task, joined back into the dispatch loop.
#[derive(Debug)]
struct RenderExit {
    job_id: String,
    success: bool,
}

/// Background service that renders ready jobs.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    store: Arc<PartStore>,
    runner: Arc<ConcatRunner>,
    config: DispatcherConfig,
    cancellation_token: CancellationToken,
    running: AtomicBool,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<PartStore>,
        runner: Arc<ConcatRunner>,
        config: DispatcherConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            config,
            cancellation_token,
            running: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Starting an already running dispatcher is a
    /// logged no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already running");
            return;
        }
        info!(
            max_concurrency = self.config.max_concurrency,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "starting dispatcher"
        );
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.task.lock() = Some(handle);
    }

    /// Stop the loop, cancel in-flight renders and wait for their cleanup.
    /// Stopping an already stopped dispatcher is a logged no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("dispatcher not running");
            return;
        }
        self.cancellation_token.cancel();

        // Take the handle out of the mutex before awaiting.
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "dispatch loop ended abnormally");
        }
        info!("dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renders: JoinSet<RenderExit> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    debug!("dispatch loop shutting down");
                    break;
                }
                _ = tick.tick() => {
                    for order in self
                        .registry
                        .dispatch_candidates(self.config.max_concurrency, &self.cancellation_token)
                    {
                        let this = Arc::clone(&self);
                        renders.spawn(async move { this.render_job(order).await });
                    }
                }
                Some(joined) = renders.join_next() => {
                    self.reconcile(joined);
                }
            }
        }

        // Render tokens are children of ours, so in-flight tasks are already
        // killing their processes; record their outcomes before returning.
        while let Some(joined) = renders.join_next().await {
            self.reconcile(joined);
        }
    }

    fn reconcile(&self, joined: Result<RenderExit, JoinError>) {
        match joined {
            Ok(exit) => self.registry.finish_render(&exit.job_id, exit.success),
            Err(err) => warn!(error = %err, "render task panicked"),
        }
    }

    /// Run one job end to end: write the manifest, drive ffmpeg, clean up the
    /// files the terminal state no longer needs. Always reports an exit.
    async fn render_job(&self, order: RenderOrder) -> RenderExit {
        let RenderOrder {
            job_id,
            part_count,
            cancel,
        } = order;
        let parts = self.store.part_paths(&job_id, part_count);
        let manifest = self.store.manifest_path(&job_id);
        let output = self.store.output_path(&job_id);

        info!(job_id = %job_id, part_count, "starting concat render");

        let contents = ConcatRunner::manifest_contents(&parts);
        if let Err(err) = tokio::fs::write(&manifest, contents).await {
            warn!(job_id = %job_id, error = %err, "failed to write concat manifest");
            storage::remove_quietly(&manifest).await;
            return RenderExit {
                job_id,
                success: false,
            };
        }

        let mut child = match self.runner.spawn(&manifest, &output) {
            Ok(child) => child,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to spawn ffmpeg");
                storage::remove_quietly(&manifest).await;
                return RenderExit {
                    job_id,
                    success: false,
                };
            }
        };
        let stderr = concat::collect_stderr(child.stderr.take());

        let mut cancelled = false;
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                if let Err(err) = child.start_kill() {
                    warn!(job_id = %job_id, error = %err, "failed to kill ffmpeg");
                }
                child.wait().await
            }
            status = child.wait() => status,
        };

        // The manifest only exists for the duration of the run.
        storage::remove_quietly(&manifest).await;

        let success = match status {
            Ok(status) if status.success() && !cancelled => true,
            Ok(status) => {
                if cancelled {
                    info!(job_id = %job_id, "render cancelled");
                } else {
                    let lines = stderr.await.unwrap_or_default();
                    let from = lines.len().saturating_sub(8);
                    warn!(
                        job_id = %job_id,
                        code = status.code().unwrap_or(-1),
                        stderr = %lines[from..].join("\n"),
                        "ffmpeg exited with failure"
                    );
                }
                false
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "failed to await ffmpeg");
                false
            }
        };

        if success {
            // Parts stay on disk until the job is destroyed or evicted.
            info!(job_id = %job_id, output = %output.display(), "render complete");
        } else if cancelled {
            // Destroy semantics: a cancelled job leaves nothing behind.
            self.store.remove_job_files(&job_id, part_count).await;
        } else {
            // A failed run must not leave a partial output that a later
            // download could serve.
            storage::remove_quietly(&output).await;
        }

        RenderExit { job_id, success }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, RegistryLimits};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    const OWNER: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

    fn fixture(dir: &TempDir, ffmpeg: &str, tick: Duration) -> Arc<Dispatcher> {
        let registry = Arc::new(JobRegistry::new(RegistryLimits::default()));
        let store = Arc::new(PartStore::new(
            dir.path().join("in"),
            dir.path().join("out"),
        ));
        Arc::new(Dispatcher::new(
            registry,
            store,
            Arc::new(ConcatRunner::with_ffmpeg_path(ffmpeg)),
            DispatcherConfig {
                max_concurrency: 2,
                tick_interval: tick,
            },
            CancellationToken::new(),
        ))
    }

    async fn make_ready(dispatcher: &Arc<Dispatcher>, part_count: u32) -> String {
        tokio::fs::create_dir_all(dispatcher.store.input_dir())
            .await
            .unwrap();
        tokio::fs::create_dir_all(dispatcher.store.output_dir())
            .await
            .unwrap();
        let id = dispatcher.registry.create_job(OWNER, part_count).unwrap();
        for part in 0..part_count {
            let path = dispatcher.store.part_path(&id, part);
            tokio::fs::write(&path, format!("part {part}")).await.unwrap();
            let guard = dispatcher
                .registry
                .begin_part_upload(OWNER, &id, part, Some(6), path)
                .unwrap();
            guard.finish();
        }
        id
    }

    async fn wait_for_status(dispatcher: &Arc<Dispatcher>, id: &str, want: JobStatus) {
        for _ in 0..200 {
            if dispatcher.registry.inspect(id).unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "job {id} never reached {want}, stuck at {}",
            dispatcher.registry.inspect(id).unwrap().status
        );
    }

    #[test]
    fn test_dispatcher_config_default() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.tick_interval, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let dispatcher = fixture(&dir, "true", Duration::from_millis(10));

        assert!(!dispatcher.is_running());
        dispatcher.start();
        dispatcher.start();
        assert!(dispatcher.is_running());

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        dispatcher.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_render_removes_manifest_and_keeps_parts() {
        let dir = TempDir::new().unwrap();
        // `true` ignores its arguments and exits 0, standing in for a concat
        // that succeeds without producing output.
        let dispatcher = fixture(&dir, "true", Duration::from_millis(10));
        let id = make_ready(&dispatcher, 2).await;

        dispatcher.start();
        wait_for_status(&dispatcher, &id, JobStatus::Done).await;
        dispatcher.stop().await;

        assert!(!dispatcher.store.manifest_path(&id).exists());
        for part in 0..2 {
            assert!(dispatcher.store.part_path(&id, part).exists());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_render_marks_job_failed_and_drops_partial_output() {
        let dir = TempDir::new().unwrap();
        let dispatcher = fixture(&dir, "false", Duration::from_millis(10));
        let id = make_ready(&dispatcher, 2).await;
        // A partial output left behind by the failed run must be removed.
        tokio::fs::write(dispatcher.store.output_path(&id), b"partial")
            .await
            .unwrap();

        dispatcher.start();
        wait_for_status(&dispatcher, &id, JobStatus::Failed).await;
        dispatcher.stop().await;

        assert!(!dispatcher.store.output_path(&id).exists());
        assert!(!dispatcher.store.manifest_path(&id).exists());
        // Parts are only removed by destroy or eviction.
        for part in 0..2 {
            assert!(dispatcher.store.part_path(&id, part).exists());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_fails_the_job() {
        let dir = TempDir::new().unwrap();
        let dispatcher = fixture(
            &dir,
            "/nonexistent/mp4join-test-ffmpeg",
            Duration::from_millis(10),
        );
        let id = make_ready(&dispatcher, 2).await;

        dispatcher.start();
        wait_for_status(&dispatcher, &id, JobStatus::Failed).await;
        dispatcher.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_destroy_kills_an_active_render() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow-ffmpeg.sh");
        tokio::fs::write(&script, "#!/bin/sh\nsleep 30\n")
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&script).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&script, perms).await.unwrap();

        let dispatcher = fixture(&dir, &script.to_string_lossy(), Duration::from_millis(10));
        let id = make_ready(&dispatcher, 2).await;

        dispatcher.start();
        wait_for_status(&dispatcher, &id, JobStatus::Rendering).await;

        let outcome = dispatcher.registry.destroy_job(&id).unwrap();
        assert!(outcome.render_active);
        wait_for_status(&dispatcher, &id, JobStatus::Failed).await;
        dispatcher.stop().await;

        for part in 0..2 {
            assert!(!dispatcher.store.part_path(&id, part).exists());
        }
    }
}
