//! Cache sweeper for automatic cleanup of finished jobs and stale outputs.
//!
//! Runs in the background and periodically drops terminal jobs from the
//! registry (freeing their owners' quota slots) and removes output files
//! that were never downloaded.

use std::sync::Arc;

use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::job::JobRegistry;
use crate::storage::PartStore;

/// Configuration for cache sweeping.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How long terminal jobs and undownloaded outputs are retained.
    /// Set to zero to retain them indefinitely.
    pub retention: Duration,

    /// Interval between sweep runs.
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            interval: Duration::from_secs(60),
        }
    }
}

impl SweepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retention period.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the sweep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// What one sweep run removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub outputs_removed: u64,
    pub jobs_evicted: usize,
}

/// Cache sweeper service.
pub struct CacheSweeper {
    config: SweepConfig,
    registry: Arc<JobRegistry>,
    store: Arc<PartStore>,
}

impl CacheSweeper {
    pub fn new(config: SweepConfig, registry: Arc<JobRegistry>, store: Arc<PartStore>) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Run a single sweep over the output directory and the registry.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        // Zero retention keeps everything forever.
        if self.config.retention.is_zero() {
            debug!("cache sweeping disabled (retention is zero)");
            return Ok(SweepReport::default());
        }

        let outputs_removed = self.store.sweep_outputs(self.config.retention).await?;
        let evicted = self.registry.evict_expired(self.config.retention);
        // Eviction is where a finished job's remaining files (kept parts, an
        // undownloaded output) are finally reclaimed.
        for job in &evicted {
            self.store.remove_job_files(&job.id, job.part_count).await;
        }

        let report = SweepReport {
            outputs_removed,
            jobs_evicted: evicted.len(),
        };
        if report.outputs_removed > 0 || report.jobs_evicted > 0 {
            info!(
                outputs = report.outputs_removed,
                jobs = report.jobs_evicted,
                "sweep removed stale state"
            );
        } else {
            debug!("nothing to sweep");
        }
        Ok(report)
    }

    /// Start the background sweep task.
    pub fn start_background_task(&self, cancellation_token: CancellationToken) {
        let config = self.config.clone();
        let registry = self.registry.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let sweeper = CacheSweeper {
                config: config.clone(),
                registry,
                store,
            };

            let mut tick = interval(config.interval);

            info!(
                retention_secs = config.retention.as_secs(),
                interval_secs = config.interval.as_secs(),
                "cache sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("cache sweeper shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        if let Err(err) = sweeper.run_sweep().await {
                            error!(error = %err, "sweep run failed");
                        }
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }
}
