//! Job registry: admission, upload bookkeeping, dispatch selection and
//! cancellation.
//!
//! The registry is the single source of truth for job state. Every mutation
//! goes through one lock, so upload handlers, the dispatch loop and the
//! sweeper can never observe a half-applied transition. Callers receive
//! snapshots or RAII guards, never references into the table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::{ALLOWED_PART_COUNTS, Job, JobStatus, JobView, RenderHandle, RenderOutcome};
use crate::{Error, Result};

/// Admission limits enforced by the registry.
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    /// Maximum number of tracked jobs per client address.
    pub max_jobs_per_address: usize,
    /// Maximum declared size of one uploaded part, in bytes.
    pub max_part_size: u64,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_jobs_per_address: 5,
            max_part_size: 40 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, Job>,
    /// Job ids per owner in creation order. Quota counts this list.
    by_owner: HashMap<IpAddr, Vec<String>>,
    next_seq: u64,
}

/// Owner of all [`Job`]s, passed explicitly (as an `Arc`) to every component.
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
    limits: RegistryLimits,
}

/// Instruction to render one job, handed to the dispatcher with the render
/// handle already attached so the job cannot be selected twice.
#[derive(Debug)]
pub struct RenderOrder {
    pub job_id: String,
    pub part_count: u32,
    pub cancel: CancellationToken,
}

/// Result of destroying a job. When a render was active its task performs the
/// file cleanup after killing the child; otherwise the caller does.
#[derive(Debug, Clone, Copy)]
pub struct DestroyOutcome {
    pub part_count: u32,
    pub render_active: bool,
}

/// Identity of a job dropped by [`JobRegistry::evict_expired`], so the caller
/// can remove whatever files it left behind.
#[derive(Debug)]
pub struct EvictedJob {
    pub id: String,
    pub part_count: u32,
}

impl JobRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            limits,
        }
    }

    pub fn limits(&self) -> &RegistryLimits {
        &self.limits
    }

    /// Create a job for `address`. Fails when the part count is not one of
    /// [`ALLOWED_PART_COUNTS`] or the address has exhausted its quota.
    pub fn create_job(&self, address: IpAddr, part_count: u32) -> Result<String> {
        if !ALLOWED_PART_COUNTS.contains(&part_count) {
            return Err(Error::InvalidPartCount(part_count));
        }

        let mut inner = self.inner.lock();
        let owned = inner.by_owner.get(&address).map_or(0, Vec::len);
        if owned >= self.limits.max_jobs_per_address {
            return Err(Error::QuotaExceeded { address });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = Uuid::new_v4().to_string();
        inner.by_owner.entry(address).or_default().push(id.clone());
        inner
            .jobs
            .insert(id.clone(), Job::new(id.clone(), address, part_count, seq));
        info!(job_id = %id, address = %address, part_count, "job created");
        Ok(id)
    }

    /// Address-agnostic lookup; callers enforce ownership on the snapshot.
    pub fn inspect(&self, id: &str) -> Option<JobView> {
        let inner = self.inner.lock();
        inner.jobs.get(id).map(|job| JobView {
            id: job.id.clone(),
            owner: job.owner,
            part_count: job.part_count,
            status: job.status(),
        })
    }

    /// Number of jobs currently tracked across all addresses.
    pub fn tracked_jobs(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Admit one part upload, checking ownership, job state, part index and
    /// declared length in that order. On success the part is marked as
    /// receiving and the returned guard either promotes it to received
    /// ([`PartUpload::finish`]) or rolls everything back on drop.
    pub fn begin_part_upload(
        self: &Arc<Self>,
        address: IpAddr,
        id: &str,
        part: u32,
        declared_len: Option<u64>,
        path: PathBuf,
    ) -> Result<PartUpload> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("job", id))?;

        if job.owner != address {
            return Err(Error::WrongOwner { id: id.to_string() });
        }
        let status = job.status();
        if status != JobStatus::Pending {
            return Err(Error::UploadClosed {
                id: id.to_string(),
                status,
            });
        }
        if part >= job.part_count {
            return Err(Error::PartOutOfRange {
                part,
                part_count: job.part_count,
            });
        }
        if job.receiving.contains(&part) || job.received.contains(&part) {
            return Err(Error::PartUnavailable { part });
        }
        let declared = match declared_len {
            Some(len) if len > 0 => len,
            _ => return Err(Error::LengthRequired),
        };
        if declared > self.limits.max_part_size {
            return Err(Error::PayloadTooLarge {
                declared,
                max: self.limits.max_part_size,
            });
        }

        job.receiving.insert(part);
        debug!(job_id = %id, part, declared, "part upload admitted");
        Ok(PartUpload {
            registry: Arc::clone(self),
            job_id: id.to_string(),
            part,
            declared,
            path,
            finished: false,
        })
    }

    fn finish_part(&self, id: &str, part: u32) {
        let mut inner = self.inner.lock();
        // The job may have been evicted or destroyed while bytes were still
        // arriving; nothing left to record in that case.
        let Some(job) = inner.jobs.get_mut(id) else {
            return;
        };
        job.receiving.remove(&part);
        job.received.insert(part);
        if job.status() == JobStatus::Ready {
            info!(job_id = %id, "all parts received, job ready for dispatch");
        } else {
            debug!(
                job_id = %id,
                part,
                received = job.received.len(),
                part_count = job.part_count,
                "part received"
            );
        }
    }

    fn abort_part(&self, id: &str, part: u32) {
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(id) {
            job.receiving.remove(&part);
            debug!(job_id = %id, part, "part upload rolled back");
        }
    }

    /// Select up to the free concurrency budget of `ready` jobs, oldest
    /// first, and attach their render handles. Counting and attaching happen
    /// under one lock so a job can never be dispatched twice.
    pub fn dispatch_candidates(
        &self,
        max_concurrency: usize,
        parent: &CancellationToken,
    ) -> Vec<RenderOrder> {
        let mut inner = self.inner.lock();
        let rendering = inner
            .jobs
            .values()
            .filter(|job| job.render.is_some())
            .count();
        if rendering >= max_concurrency {
            return Vec::new();
        }
        let budget = max_concurrency - rendering;

        let mut ready: Vec<(u64, String)> = inner
            .jobs
            .values()
            .filter(|job| job.status() == JobStatus::Ready)
            .map(|job| (job.seq, job.id.clone()))
            .collect();
        ready.sort_unstable();

        let mut orders = Vec::with_capacity(budget.min(ready.len()));
        for (_, id) in ready.into_iter().take(budget) {
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            let cancel = parent.child_token();
            job.render = Some(RenderHandle::new(cancel.clone()));
            orders.push(RenderOrder {
                job_id: id,
                part_count: job.part_count,
                cancel,
            });
        }
        orders
    }

    /// Reconcile a finished render: detach the handle and record the terminal
    /// outcome. A job already terminal (destroyed mid-render) keeps its
    /// existing outcome.
    pub fn finish_render(&self, id: &str, success: bool) {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(id) else {
            warn!(job_id = %id, "render finished for a job no longer tracked");
            return;
        };
        job.render = None;
        if job.outcome.is_none() {
            job.outcome = Some(if success {
                RenderOutcome::Completed
            } else {
                RenderOutcome::Failed
            });
            job.finished_at = Some(Utc::now());
        }
        info!(job_id = %id, status = %job.status(), "render reconciled");
    }

    /// Forcibly cancel a job. An active render is killed through its token
    /// (its task then removes the job's files); an idle job is marked failed
    /// here and the caller removes the files. Safe in every status.
    pub fn destroy_job(&self, id: &str) -> Result<DestroyOutcome> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("job", id))?;

        let render_active = job.render.is_some();
        if let Some(handle) = &job.render {
            handle.cancel();
        }
        if job.outcome.is_none() {
            job.outcome = Some(RenderOutcome::Failed);
            job.finished_at = Some(Utc::now());
        }
        info!(job_id = %id, render_active, "job destroyed");
        Ok(DestroyOutcome {
            part_count: job.part_count,
            render_active,
        })
    }

    /// Drop terminal jobs whose outcome is older than `retention`, freeing
    /// their owners' quota slots. Non-terminal jobs are never evicted. The
    /// returned list tells the caller which files to reclaim.
    pub fn evict_expired(&self, retention: Duration) -> Vec<EvictedJob> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let expired: Vec<(String, IpAddr, u32)> = inner
            .jobs
            .values()
            .filter(|job| match job.finished_at {
                Some(finished) if job.outcome.is_some() => now
                    .signed_duration_since(finished)
                    .to_std()
                    .map(|age| age > retention)
                    .unwrap_or(false),
                _ => false,
            })
            .map(|job| (job.id.clone(), job.owner, job.part_count))
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for (id, owner, part_count) in expired {
            inner.jobs.remove(&id);
            if let Some(ids) = inner.by_owner.get_mut(&owner) {
                ids.retain(|existing| existing != &id);
                if ids.is_empty() {
                    inner.by_owner.remove(&owner);
                }
            }
            evicted.push(EvictedJob { id, part_count });
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "evicted expired jobs");
        }
        evicted
    }
}

/// RAII guard for one in-flight part upload.
///
/// While the guard lives the part index sits in the job's receiving set, so a
/// second upload of the same index is rejected. Dropping the guard without
/// [`finish`](Self::finish) removes the partial file and frees the index
/// again; this also covers the client disconnecting, which drops the upload
/// handler future.
pub struct PartUpload {
    registry: Arc<JobRegistry>,
    job_id: String,
    part: u32,
    declared: u64,
    path: PathBuf,
    finished: bool,
}

impl PartUpload {
    /// Where the part's bytes must be written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared length the body must match exactly.
    pub fn declared(&self) -> u64 {
        self.declared
    }

    /// Promote the part from receiving to received after a clean flush.
    pub fn finish(mut self) {
        self.finished = true;
        self.registry.finish_part(&self.job_id, self.part);
    }
}

impl Drop for PartUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Remove the file before freeing the index: a concurrent retry of the
        // same part must not have its fresh file deleted from under it.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial part file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove partial part file");
            }
        }
        self.registry.abort_part(&self.job_id, self.part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    fn registry() -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(RegistryLimits {
            max_jobs_per_address: 5,
            max_part_size: 1024,
        }))
    }

    fn upload_all_parts(registry: &Arc<JobRegistry>, owner: IpAddr, id: &str, dir: &TempDir) {
        let part_count = registry.inspect(id).unwrap().part_count;
        for part in 0..part_count {
            let path = dir.path().join(format!("{id}-{part}"));
            let guard = registry
                .begin_part_upload(owner, id, part, Some(1), path)
                .unwrap();
            guard.finish();
        }
    }

    #[test]
    fn test_create_job_validates_part_count() {
        let registry = registry();
        for invalid in [0u32, 1, 3, 5, 6, 7, 9, 15, 17, 32] {
            assert!(matches!(
                registry.create_job(addr(1), invalid),
                Err(Error::InvalidPartCount(value)) if value == invalid
            ));
        }

        let mut ids = HashSet::new();
        for (n, valid) in [2u32, 4, 8, 16].into_iter().enumerate() {
            let id = registry.create_job(addr(n as u8), valid).unwrap();
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn test_quota_is_enforced_per_address() {
        let registry = registry();
        for _ in 0..5 {
            registry.create_job(addr(1), 2).unwrap();
        }
        assert!(matches!(
            registry.create_job(addr(1), 2),
            Err(Error::QuotaExceeded { .. })
        ));
        // A different address is unaffected.
        registry.create_job(addr(2), 2).unwrap();
    }

    #[test]
    fn test_quota_counts_jobs_regardless_of_status() {
        let registry = Arc::new(JobRegistry::new(RegistryLimits {
            max_jobs_per_address: 2,
            max_part_size: 1024,
        }));
        let first = registry.create_job(addr(1), 2).unwrap();
        registry.create_job(addr(1), 2).unwrap();
        // Destroying a job leaves it tracked (terminal) until eviction.
        registry.destroy_job(&first).unwrap();
        assert!(matches!(
            registry.create_job(addr(1), 2),
            Err(Error::QuotaExceeded { .. })
        ));
    }

    #[test]
    fn test_upload_admission_rejections() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let id = registry.create_job(addr(1), 4).unwrap();
        let path = |name: &str| dir.path().join(name);

        assert!(matches!(
            registry.begin_part_upload(addr(1), "nope", 0, Some(1), path("a")),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            registry.begin_part_upload(addr(2), &id, 0, Some(1), path("b")),
            Err(Error::WrongOwner { .. })
        ));
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 4, Some(1), path("c")),
            Err(Error::PartOutOfRange { part: 4, part_count: 4 })
        ));
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 0, None, path("d")),
            Err(Error::LengthRequired)
        ));
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 0, Some(0), path("e")),
            Err(Error::LengthRequired)
        ));
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 0, Some(4096), path("f")),
            Err(Error::PayloadTooLarge { declared: 4096, max: 1024 })
        ));
    }

    #[test]
    fn test_duplicate_part_uploads_are_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let id = registry.create_job(addr(1), 2).unwrap();

        let guard = registry
            .begin_part_upload(addr(1), &id, 0, Some(1), dir.path().join("p0"))
            .unwrap();
        // Still receiving: a concurrent upload of the same index is refused.
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 0, Some(1), dir.path().join("p0b")),
            Err(Error::PartUnavailable { part: 0 })
        ));
        guard.finish();
        // Received: same story.
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 0, Some(1), dir.path().join("p0c")),
            Err(Error::PartUnavailable { part: 0 })
        ));
    }

    #[test]
    fn test_aborted_part_stays_reuploadable() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let id = registry.create_job(addr(1), 2).unwrap();

        let path = dir.path().join("p0");
        std::fs::write(&path, b"partial").unwrap();
        let guard = registry
            .begin_part_upload(addr(1), &id, 0, Some(10), path.clone())
            .unwrap();
        drop(guard);

        assert!(!path.exists());
        assert_eq!(registry.inspect(&id).unwrap().status, JobStatus::Pending);
        registry
            .begin_part_upload(addr(1), &id, 0, Some(10), path)
            .unwrap();
    }

    #[test]
    fn test_all_parts_received_transitions_to_ready_once() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let id = registry.create_job(addr(1), 4).unwrap();

        upload_all_parts(&registry, addr(1), &id, &dir);
        assert_eq!(registry.inspect(&id).unwrap().status, JobStatus::Ready);

        // No further uploads are accepted once the job left `pending`.
        assert!(matches!(
            registry.begin_part_upload(addr(1), &id, 1, Some(1), dir.path().join("late")),
            Err(Error::UploadClosed { .. })
        ));
    }

    #[test]
    fn test_dispatch_is_fifo_within_budget() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let root = CancellationToken::new();

        let first = registry.create_job(addr(1), 2).unwrap();
        let second = registry.create_job(addr(2), 2).unwrap();
        let third = registry.create_job(addr(1), 2).unwrap();
        for id in [&first, &second, &third] {
            let owner = registry.inspect(id).unwrap().owner;
            upload_all_parts(&registry, owner, id, &dir);
        }

        let orders = registry.dispatch_candidates(2, &root);
        let ids: Vec<_> = orders.iter().map(|order| order.job_id.clone()).collect();
        assert_eq!(ids, vec![first.clone(), second.clone()]);
        assert_eq!(registry.inspect(&first).unwrap().status, JobStatus::Rendering);

        // Budget exhausted: the third job stays ready.
        assert!(registry.dispatch_candidates(2, &root).is_empty());
        assert_eq!(registry.inspect(&third).unwrap().status, JobStatus::Ready);

        // A freed slot picks up the oldest remaining ready job.
        registry.finish_render(&first, true);
        let orders = registry.dispatch_candidates(2, &root);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].job_id, third);

        // Terminal jobs are never selected again.
        registry.finish_render(&second, true);
        registry.finish_render(&third, true);
        assert!(registry.dispatch_candidates(2, &root).is_empty());
    }

    #[test]
    fn test_finish_render_records_outcome() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let root = CancellationToken::new();

        let ok = registry.create_job(addr(1), 2).unwrap();
        let bad = registry.create_job(addr(1), 2).unwrap();
        upload_all_parts(&registry, addr(1), &ok, &dir);
        upload_all_parts(&registry, addr(1), &bad, &dir);
        registry.dispatch_candidates(2, &root);

        registry.finish_render(&ok, true);
        registry.finish_render(&bad, false);
        assert_eq!(registry.inspect(&ok).unwrap().status, JobStatus::Done);
        assert_eq!(registry.inspect(&bad).unwrap().status, JobStatus::Failed);

        // Unknown ids are tolerated.
        registry.finish_render("gone", true);
    }

    #[test]
    fn test_destroy_idle_job() {
        let registry = registry();
        let id = registry.create_job(addr(1), 4).unwrap();

        let outcome = registry.destroy_job(&id).unwrap();
        assert!(!outcome.render_active);
        assert_eq!(outcome.part_count, 4);
        assert_eq!(registry.inspect(&id).unwrap().status, JobStatus::Failed);

        assert!(matches!(
            registry.destroy_job("unknown"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_destroy_rendering_job_cancels_render_token() {
        let dir = TempDir::new().unwrap();
        let registry = registry();
        let root = CancellationToken::new();
        let id = registry.create_job(addr(1), 2).unwrap();
        upload_all_parts(&registry, addr(1), &id, &dir);

        let orders = registry.dispatch_candidates(1, &root);
        assert_eq!(orders.len(), 1);
        assert!(!orders[0].cancel.is_cancelled());

        let outcome = registry.destroy_job(&id).unwrap();
        assert!(outcome.render_active);
        assert!(orders[0].cancel.is_cancelled());
        assert_eq!(registry.inspect(&id).unwrap().status, JobStatus::Failed);

        // The render task later reports the (killed) exit; the outcome holds.
        registry.finish_render(&id, false);
        assert_eq!(registry.inspect(&id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_evict_expired_frees_quota() {
        let registry = Arc::new(JobRegistry::new(RegistryLimits {
            max_jobs_per_address: 1,
            max_part_size: 1024,
        }));
        let id = registry.create_job(addr(1), 2).unwrap();
        assert!(matches!(
            registry.create_job(addr(1), 2),
            Err(Error::QuotaExceeded { .. })
        ));

        registry.destroy_job(&id).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let evicted = registry.evict_expired(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, id);
        assert_eq!(evicted[0].part_count, 2);
        assert!(registry.inspect(&id).is_none());
        assert_eq!(registry.tracked_jobs(), 0);

        // The quota slot is free again.
        registry.create_job(addr(1), 2).unwrap();
    }

    #[test]
    fn test_evict_spares_non_terminal_jobs() {
        let registry = registry();
        let pending = registry.create_job(addr(1), 2).unwrap();
        assert!(registry.evict_expired(Duration::ZERO).is_empty());
        assert!(registry.inspect(&pending).is_some());
    }
}
