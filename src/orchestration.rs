//! Cross-process coordination: the shared task queue and the blacklist.
//!
//! Masters enqueue task ids per job, slaves dequeue them. Each id is handed
//! to at most one consumer; [`OrchestrationProvider::acknowledge`] marks it
//! done and is what drives [`OrchestrationProvider::remaining_count`] down to
//! zero, the signal a master waits on.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blacklist::{load_blacklist_from_path, Blacklist};
use crate::error::BackendError;
use crate::types::{ScanJob, ScanTarget};

#[async_trait]
pub trait OrchestrationProvider: Send + Sync {
    /// Connectivity check, run once at startup.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn list_jobs(&self) -> Result<Vec<ScanJob>, BackendError>;

    async fn put_job(&self, job: ScanJob) -> Result<(), BackendError>;

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError>;

    async fn dequeue_one(&self, job_id: &str) -> Result<Option<Uuid>, BackendError> {
        Ok(self.dequeue_many(job_id, 1).await?.into_iter().next())
    }

    /// Best effort: up to `n` ids, possibly fewer.
    async fn dequeue_many(&self, job_id: &str, n: usize) -> Result<Vec<Uuid>, BackendError>;

    /// Tasks enqueued for the job and not yet acknowledged.
    async fn remaining_count(&self, job_id: &str) -> Result<u64, BackendError>;

    async fn enqueue_one(&self, job_id: &str, task_id: Uuid) -> Result<(), BackendError> {
        self.enqueue_many(job_id, &[task_id]).await
    }

    async fn enqueue_many(&self, job_id: &str, task_ids: &[Uuid]) -> Result<(), BackendError>;

    /// Report a dequeued task as complete.
    async fn acknowledge(&self, job_id: &str, task_id: Uuid) -> Result<(), BackendError>;

    async fn is_blacklisted(&self, target: &ScanTarget) -> bool;

    async fn refresh_blacklist(&self) -> Result<(), BackendError>;
}

#[derive(Debug)]
struct JobQueue {
    job: ScanJob,
    queue: VecDeque<Uuid>,
    /// Dequeued, not yet acknowledged. The deadline is set only when leases are enabled.
    outstanding: HashMap<Uuid, Option<Instant>>,
    enqueued: u64,
    acknowledged: u64,
}

impl JobQueue {
    fn new(job: ScanJob) -> Self {
        Self {
            job,
            queue: VecDeque::new(),
            outstanding: HashMap::new(),
            enqueued: 0,
            acknowledged: 0,
        }
    }

    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .outstanding
            .iter()
            .filter(|(_, deadline)| deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.outstanding.remove(id);
            self.queue.push_front(*id);
        }
        expired.len()
    }

    fn snapshot(&self) -> ScanJob {
        let mut job = self.job.clone();
        job.total_issued = self.enqueued;
        job.finished = self.acknowledged;
        job.remaining = self.enqueued - self.acknowledged;
        job
    }
}

/// Single-process stand-in for a shared queue backend.
///
/// With [`with_lease`](Self::with_lease) set, a dequeued id that is not
/// acknowledged within the lease goes back to the head of its queue.
#[derive(Debug, Default)]
pub struct InMemoryOrchestrationProvider {
    jobs: Mutex<BTreeMap<String, JobQueue>>,
    blacklist: RwLock<Blacklist>,
    blacklist_source: Option<PathBuf>,
    lease: Option<Duration>,
}

impl InMemoryOrchestrationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_blacklist(self, blacklist: Blacklist) -> Self {
        *self.blacklist.write().unwrap_or_else(|e| e.into_inner()) = blacklist;
        self
    }

    /// Re-read the blacklist from `path` on every refresh.
    pub fn with_blacklist_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.blacklist_source = Some(path.into());
        self
    }

    pub fn set_blacklist(&self, blacklist: Blacklist) {
        *self.blacklist.write().unwrap_or_else(|e| e.into_inner()) = blacklist;
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, JobQueue>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OrchestrationProvider for InMemoryOrchestrationProvider {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<ScanJob>, BackendError> {
        Ok(self.jobs().values().map(JobQueue::snapshot).collect())
    }

    async fn put_job(&self, job: ScanJob) -> Result<(), BackendError> {
        let mut jobs = self.jobs();
        match jobs.get_mut(&job.id) {
            Some(existing) => existing.job = job,
            None => {
                debug!(job_id = %job.id, "registered job");
                jobs.insert(job.id.clone(), JobQueue::new(job));
            }
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError> {
        if let Some(q) = self.jobs().remove(job_id) {
            if !q.queue.is_empty() || !q.outstanding.is_empty() {
                warn!(job_id, queued = q.queue.len(), outstanding = q.outstanding.len(), "deleted job with pending tasks");
            }
        }
        Ok(())
    }

    async fn dequeue_many(&self, job_id: &str, n: usize) -> Result<Vec<Uuid>, BackendError> {
        let mut jobs = self.jobs();
        let Some(q) = jobs.get_mut(job_id) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        let reclaimed = q.reclaim_expired(now);
        if reclaimed > 0 {
            info!(job_id, reclaimed, "requeued tasks with expired leases");
        }
        let deadline = self.lease.map(|l| now + l);
        let take = n.min(q.queue.len());
        let ids: Vec<Uuid> = q.queue.drain(..take).collect();
        for id in &ids {
            q.outstanding.insert(*id, deadline);
        }
        Ok(ids)
    }

    async fn remaining_count(&self, job_id: &str) -> Result<u64, BackendError> {
        Ok(self
            .jobs()
            .get(job_id)
            .map(|q| q.enqueued - q.acknowledged)
            .unwrap_or(0))
    }

    async fn enqueue_many(&self, job_id: &str, task_ids: &[Uuid]) -> Result<(), BackendError> {
        let mut jobs = self.jobs();
        let q = jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::JobNotFound(job_id.to_string()))?;
        q.queue.extend(task_ids.iter().copied());
        q.enqueued += task_ids.len() as u64;
        Ok(())
    }

    async fn acknowledge(&self, job_id: &str, task_id: Uuid) -> Result<(), BackendError> {
        let mut jobs = self.jobs();
        let Some(q) = jobs.get_mut(job_id) else {
            return Ok(());
        };
        if q.outstanding.remove(&task_id).is_some() {
            q.acknowledged += 1;
        } else if let Some(pos) = q.queue.iter().position(|id| *id == task_id) {
            // lease expired and the id was requeued before the late ack arrived
            q.queue.remove(pos);
            q.acknowledged += 1;
        }
        Ok(())
    }

    async fn is_blacklisted(&self, target: &ScanTarget) -> bool {
        self.blacklist
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target.address)
    }

    async fn refresh_blacklist(&self) -> Result<(), BackendError> {
        let Some(path) = &self.blacklist_source else {
            return Ok(());
        };
        let fresh = load_blacklist_from_path(path)
            .map_err(|e| BackendError::Unreachable(format!("{e:#}")))?;
        debug!(entries = fresh.len(), "refreshed blacklist");
        self.set_blacklist(fresh);
        Ok(())
    }
}
