//! Task execution.
//!
//! A [`Slave`] runs three kinds of loops that only talk to each other through
//! its [`TaskRouter`]:
//! - fetch: dequeue task ids, load the tasks, mark them accepted, push to `todo`
//! - workers (N of them): pop from `todo`, run the requested scans, push to `finished`
//! - flush: drain `finished`, save each task and acknowledge it to orchestration

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::BackendError;
use crate::orchestration::OrchestrationProvider;
use crate::persistence::PersistenceProvider;
use crate::result::{is_reserved_key, ScanResult, ERROR_KEY};
use crate::router::TaskRouter;
use crate::scans::ScanRegistry;
use crate::types::ScanTask;

#[derive(Debug, Clone)]
pub struct SlaveConfig {
    /// Size of the worker pool.
    pub workers: usize,
    /// Upper bound on tasks waiting in `todo`; the fetch loop tops up to it.
    pub fetch_batch: usize,
    /// Idle sleep for the fetch loop and workers when there is nothing to do.
    pub poll_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            workers: 64,
            fetch_batch: 256,
            poll_interval: Duration::from_millis(100),
            flush_interval: Duration::from_millis(500),
        }
    }
}

pub struct Slave {
    orchestration: Arc<dyn OrchestrationProvider>,
    persistence: Arc<dyn PersistenceProvider>,
    scans: ScanRegistry,
    router: TaskRouter,
    /// Dequeued ids whose load failed, retried by the next fetch round. Fetch loop only.
    unloaded: Mutex<Vec<(String, Uuid)>>,
    config: SlaveConfig,
    span: Span,
}

impl Slave {
    pub fn new(
        orchestration: Arc<dyn OrchestrationProvider>,
        persistence: Arc<dyn PersistenceProvider>,
        scans: ScanRegistry,
        config: SlaveConfig,
        span: Span,
    ) -> Self {
        let router = TaskRouter::new(info_span!(parent: &span, "router"));
        Self {
            orchestration,
            persistence,
            scans,
            router,
            unloaded: Mutex::new(Vec::new()),
            config,
            span,
        }
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    /// Run until `cancel` fires.
    ///
    /// On shutdown the fetch loop stops first, workers finish the task they
    /// hold, and a last flush persists whatever completed. Tasks still in
    /// `todo` are left unacknowledged for the orchestration backend to redeliver.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(parent: &self.span, workers = self.config.workers, "slave started");

        let mut set = JoinSet::new();
        let me = Arc::clone(&self);
        let c = cancel.clone();
        set.spawn(
            async move { me.fetch_loop(c).await }
                .instrument(info_span!(parent: &self.span, "fetch")),
        );
        for id in 0..self.config.workers.max(1) {
            let me = Arc::clone(&self);
            let c = cancel.clone();
            set.spawn(
                async move { me.worker_loop(c).await }
                    .instrument(info_span!(parent: &self.span, "worker", id)),
            );
        }

        let workers_done = CancellationToken::new();
        let me = Arc::clone(&self);
        let done = workers_done.clone();
        let flush = tokio::spawn(
            async move { me.flush_loop(done).await }
                .instrument(info_span!(parent: &self.span, "flush")),
        );

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(parent: &self.span, %e, "slave loop terminated abnormally");
            }
        }
        workers_done.cancel();
        if let Err(e) = flush.await {
            error!(parent: &self.span, %e, "flush loop terminated abnormally");
        }

        let abandoned = self.router.todo_count() + self.unloaded().len();
        if abandoned > 0 {
            warn!(parent: &self.span, abandoned, "shutting down with unstarted tasks");
        }
        let unflushed = self.router.finished_count();
        if unflushed > 0 {
            error!(parent: &self.span, unflushed, "shutting down with finished tasks that were not flushed");
        }
        info!(parent: &self.span, "slave stopped");
    }

    async fn fetch_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let fetched = match self.fetch_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(%e, "fetching tasks failed");
                    0
                }
            };
            if fetched == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    fn unloaded(&self) -> MutexGuard<'_, Vec<(String, Uuid)>> {
        self.unloaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Top `todo` up to `fetch_batch` from every active job. Returns how many tasks were added.
    ///
    /// An id whose load fails has already left the queue, so it is kept and
    /// retried first on the next call.
    pub async fn fetch_once(&self) -> Result<usize, BackendError> {
        let mut added = 0;

        let retry = std::mem::take(&mut *self.unloaded());
        if !retry.is_empty() {
            let mut tasks = Vec::with_capacity(retry.len());
            for (job_id, id) in retry {
                tasks.extend(self.load_accepted(&job_id, id).await);
            }
            added += tasks.len();
            self.router.add_todo_batch(tasks);
        }

        let mut room = self
            .config
            .fetch_batch
            .saturating_sub(self.router.todo_count() + self.unloaded().len());
        for job in self.orchestration.list_jobs().await? {
            if room == 0 {
                break;
            }
            let ids = self.orchestration.dequeue_many(&job.id, room).await?;
            room -= ids.len();
            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                tasks.extend(self.load_accepted(&job.id, id).await);
            }
            if !tasks.is_empty() {
                debug!(job_id = %job.id, count = tasks.len(), "fetched tasks");
                added += tasks.len();
                self.router.add_todo_batch(tasks);
            }
        }
        Ok(added)
    }

    async fn load_accepted(&self, job_id: &str, id: Uuid) -> Option<ScanTask> {
        match self.persistence.load(id).await {
            Ok(mut task) => {
                if let Err(e) = task.mark_accepted(OffsetDateTime::now_utc()) {
                    warn!(task_id = %id, %e, "unexpected task state on accept");
                }
                Some(task)
            }
            Err(e) => {
                error!(task_id = %id, job_id, %e, "dequeued task could not be loaded, will retry");
                self.unloaded().push((job_id.to_string(), id));
                None
            }
        }
    }

    async fn worker_loop(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.router.get_todo() {
                Some(task) => {
                    let done = self.execute_task(task).await;
                    self.router.add_finished(done);
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Run every requested scan and complete the task.
    ///
    /// Each scan's output is nested under the scan's name. A scan that errors
    /// or panics gets `{ "_error": message }` in its place; the remaining scans
    /// still run and the task is still completed.
    pub async fn execute_task(&self, mut task: ScanTask) -> ScanTask {
        if let Err(e) = task.mark_started(OffsetDateTime::now_utc()) {
            warn!(task_id = %task.id, %e, "unexpected task state on start");
        }

        let mut result = ScanResult::with_identifier(task.id.to_string());
        for name in &task.scans {
            if is_reserved_key(name) {
                warn!(task_id = %task.id, scan = %name, "skipping scan with a reserved name");
                continue;
            }
            let outcome = match self.scans.get(name) {
                Some(scan) => {
                    let target = task.target.clone();
                    match tokio::spawn(async move { scan.execute(&target).await }).await {
                        Ok(Ok(r)) => Ok(r),
                        Ok(Err(e)) => Err(format!("{e:#}")),
                        Err(e) => Err(format!("scan panicked: {e}")),
                    }
                }
                None => Err("scan not registered on this worker".to_string()),
            };
            match outcome {
                Ok(r) => result.add_nested(name.as_str(), r),
                Err(msg) => {
                    warn!(task_id = %task.id, scan = %name, error = %msg, "scan failed");
                    let mut failed = ScanResult::new();
                    failed.add_string(ERROR_KEY, msg);
                    result.add_nested(name.as_str(), failed);
                }
            }
        }

        if let Err(e) = task.complete(OffsetDateTime::now_utc(), result) {
            warn!(task_id = %task.id, %e, "unexpected task state on completion");
        }
        task
    }

    async fn flush_loop(&self, workers_done: CancellationToken) {
        loop {
            tokio::select! {
                _ = workers_done.cancelled() => break,
                _ = tokio::time::sleep(self.config.flush_interval) => {}
            }
            self.flush_once().await;
        }
        self.flush_once().await;
    }

    /// Persist and acknowledge everything finished. Returns how many tasks were flushed.
    ///
    /// A task whose save or acknowledge fails goes back to `finished` for the
    /// next round. Saving again is an upsert and acknowledging twice is a no-op.
    pub async fn flush_once(&self) -> usize {
        let mut flushed = 0;
        for task in self.router.drain_finished() {
            if let Err(e) = self.persistence.save(&task).await {
                error!(task_id = %task.id, %e, "saving task failed, will retry");
                self.router.add_finished(task);
                continue;
            }
            if let Err(e) = self.orchestration.acknowledge(&task.job_id, task.id).await {
                error!(task_id = %task.id, %e, "acknowledging task failed, will retry");
                self.router.add_finished(task);
                continue;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "flushed finished tasks");
        }
        flushed
    }
}
