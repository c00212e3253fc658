//! Job entity and derived status.
//!
//! A [`Job`] is one client request to assemble `part_count` uploaded parts
//! into a single output file. All of its mutable state lives behind the
//! registry lock; the status is always derived from the stored fields and
//! never cached anywhere.

pub mod registry;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use registry::{
    DestroyOutcome, EvictedJob, JobRegistry, PartUpload, RegistryLimits, RenderOrder,
};

/// Part counts a job may be created with.
pub const ALLOWED_PART_COUNTS: [u32; 4] = [2, 4, 8, 16];

/// Lifecycle of a job as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Still collecting parts.
    Pending,
    /// All parts received, waiting for a dispatch slot.
    Ready,
    /// Concat process running.
    Rendering,
    /// Concat process exited successfully.
    Done,
    /// Concat failed, was never launched cleanly, or the job was destroyed.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Rendering => "rendering",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a render, recorded when the external process exits or
/// the job is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Completed,
    Failed,
}

/// Control handle for an in-flight render. Cancelling the token makes the
/// render task kill the child process and clean up the job's files.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    cancel: CancellationToken,
}

impl RenderHandle {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// One concatenation request.
#[derive(Debug)]
pub struct Job {
    pub(crate) id: String,
    pub(crate) owner: IpAddr,
    pub(crate) part_count: u32,
    /// Creation sequence number, a total order used for FIFO dispatch.
    pub(crate) seq: u64,
    pub(crate) created_at: DateTime<Utc>,
    /// Part indices currently mid-upload.
    pub(crate) receiving: HashSet<u32>,
    /// Part indices fully uploaded and flushed.
    pub(crate) received: HashSet<u32>,
    /// Present only while the concat process is alive.
    pub(crate) render: Option<RenderHandle>,
    pub(crate) outcome: Option<RenderOutcome>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: String, owner: IpAddr, part_count: u32, seq: u64) -> Self {
        Self {
            id,
            owner,
            part_count,
            seq,
            created_at: Utc::now(),
            receiving: HashSet::new(),
            received: HashSet::new(),
            render: None,
            outcome: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> IpAddr {
        self.owner
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Derived status. Terminal outcome wins over an attached render handle,
    /// which wins over the received-set check.
    pub fn status(&self) -> JobStatus {
        match self.outcome {
            Some(RenderOutcome::Completed) => JobStatus::Done,
            Some(RenderOutcome::Failed) => JobStatus::Failed,
            None if self.render.is_some() => JobStatus::Rendering,
            None if self.received.len() as u32 == self.part_count => JobStatus::Ready,
            None => JobStatus::Pending,
        }
    }
}

/// Read-only snapshot of a job, handed out by the registry so callers never
/// hold the lock across I/O.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: String,
    pub owner: IpAddr,
    pub part_count: u32,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn job(part_count: u32) -> Job {
        Job::new(
            "job-1".to_string(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            part_count,
            0,
        )
    }

    #[test]
    fn test_status_pending_until_all_parts_received() {
        let mut job = job(4);
        assert_eq!(job.status(), JobStatus::Pending);

        job.received.insert(0);
        job.received.insert(1);
        job.received.insert(2);
        assert_eq!(job.status(), JobStatus::Pending);

        job.received.insert(3);
        assert_eq!(job.status(), JobStatus::Ready);
    }

    #[test]
    fn test_status_rendering_while_handle_attached() {
        let mut job = job(2);
        job.received.insert(0);
        job.received.insert(1);
        job.render = Some(RenderHandle::new(CancellationToken::new()));
        assert_eq!(job.status(), JobStatus::Rendering);
    }

    #[test]
    fn test_terminal_outcome_wins() {
        let mut job = job(2);
        job.received.insert(0);
        job.received.insert(1);
        job.render = Some(RenderHandle::new(CancellationToken::new()));

        job.outcome = Some(RenderOutcome::Completed);
        assert_eq!(job.status(), JobStatus::Done);

        job.outcome = Some(RenderOutcome::Failed);
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(JobStatus::Rendering).unwrap(),
            serde_json::json!("rendering")
        );
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }
}
