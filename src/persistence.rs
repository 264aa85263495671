//! Durable storage for tasks and their results.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BackendError;
use crate::types::{PersistenceStats, ScanTask};

#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Connectivity check, run once at startup.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Store a batch of new tasks. Each record is written whole; re-running
    /// the same batch overwrites rather than duplicates.
    async fn bulk_create(&self, tasks: &[ScanTask]) -> Result<(), BackendError>;

    async fn load(&self, id: Uuid) -> Result<ScanTask, BackendError>;

    /// Upsert by id.
    async fn save(&self, task: &ScanTask) -> Result<(), BackendError>;

    /// Aggregate over one job's tasks, or over everything when `job_id` is `None`.
    async fn stats(&self, job_id: Option<&str>) -> Result<PersistenceStats, BackendError>;
}

#[derive(Debug, Default)]
struct Store {
    tasks: HashMap<Uuid, ScanTask>,
    order: Vec<Uuid>,
}

impl Store {
    fn upsert(&mut self, task: ScanTask) {
        if self.tasks.insert(task.id, task.clone()).is_none() {
            self.order.push(task.id);
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPersistenceProvider {
    store: Mutex<Store>,
}

impl InMemoryPersistenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The first `n` tasks in creation order.
    pub fn first(&self, n: usize) -> Vec<ScanTask> {
        let store = self.store();
        store
            .order
            .iter()
            .take(n)
            .filter_map(|id| store.tasks.get(id).cloned())
            .collect()
    }

    pub fn tasks(&self) -> Vec<ScanTask> {
        self.first(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.store().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dump every stored task as pretty JSON.
    pub fn write_tasks_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &self.tasks())?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceProvider for InMemoryPersistenceProvider {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn bulk_create(&self, tasks: &[ScanTask]) -> Result<(), BackendError> {
        let mut store = self.store();
        for t in tasks {
            store.upsert(t.clone());
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<ScanTask, BackendError> {
        self.store()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(BackendError::TaskNotFound(id))
    }

    async fn save(&self, task: &ScanTask) -> Result<(), BackendError> {
        self.store().upsert(task.clone());
        Ok(())
    }

    async fn stats(&self, job_id: Option<&str>) -> Result<PersistenceStats, BackendError> {
        let store = self.store();
        let mut stats = PersistenceStats::default();
        for t in store
            .tasks
            .values()
            .filter(|t| job_id.map_or(true, |j| t.job_id == j))
        {
            stats.total_tasks += 1;
            if let Some(done) = t.completed() {
                stats.finished_tasks += 1;
                stats.earliest_completed = Some(stats.earliest_completed.map_or(done, |e| e.min(done)));
            }
            if let Some(created) = t.created() {
                stats.earliest_created = Some(stats.earliest_created.map_or(created, |e| e.min(created)));
            }
        }
        Ok(stats)
    }
}
