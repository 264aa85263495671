use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::result::ScanResult;

/// An address plus the ports to probe on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    pub address: String,
    pub ports: BTreeSet<u16>,
}

impl ScanTarget {
    pub fn new(address: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            address: address.into(),
            ports: ports.into_iter().collect(),
        }
    }
}

/// One unit of work: a target, the scans to run on it, and its lifecycle.
///
/// Timestamps only move from unset to set, in the order
/// created <= accepted <= started <= completed.
///
/// Deserializing restores a stored task as it was, timestamps and result included.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanTask {
    pub id: Uuid,
    pub job_id: String,
    pub creator_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    accepted: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    started: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    completed: Option<OffsetDateTime>,
    pub target: ScanTarget,
    pub scans: BTreeSet<String>,
    #[serde(default)]
    result: Option<ScanResult>,
}

impl ScanTask {
    /// A fresh task with a new id and `created` stamped now.
    pub fn new(
        job_id: impl Into<String>,
        creator_id: impl Into<String>,
        target: ScanTarget,
        scans: BTreeSet<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.into(),
            creator_id: creator_id.into(),
            created: Some(OffsetDateTime::now_utc()),
            accepted: None,
            started: None,
            completed: None,
            target,
            scans,
            result: None,
        }
    }

    pub fn created(&self) -> Option<OffsetDateTime> {
        self.created
    }

    pub fn accepted(&self) -> Option<OffsetDateTime> {
        self.accepted
    }

    pub fn started(&self) -> Option<OffsetDateTime> {
        self.started
    }

    pub fn completed(&self) -> Option<OffsetDateTime> {
        self.completed
    }

    pub fn result(&self) -> Option<&ScanResult> {
        self.result.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    pub fn mark_accepted(&mut self, at: OffsetDateTime) -> Result<(), LifecycleError> {
        let prev = self.created;
        stamp(&mut self.accepted, at, "accepted", prev, "created")
    }

    pub fn mark_started(&mut self, at: OffsetDateTime) -> Result<(), LifecycleError> {
        let prev = self.accepted.or(self.created);
        stamp(&mut self.started, at, "started", prev, "accepted")
    }

    /// Stamp `completed` and attach the result. The result is set once.
    pub fn complete(&mut self, at: OffsetDateTime, result: ScanResult) -> Result<(), LifecycleError> {
        let prev = self.started.or(self.accepted).or(self.created);
        stamp(&mut self.completed, at, "completed", prev, "started")?;
        self.result = Some(result);
        Ok(())
    }
}

fn stamp(
    slot: &mut Option<OffsetDateTime>,
    at: OffsetDateTime,
    stage: &'static str,
    previous: Option<OffsetDateTime>,
    previous_name: &'static str,
) -> Result<(), LifecycleError> {
    if slot.is_some() {
        return Err(LifecycleError::AlreadySet(stage));
    }
    if previous.is_some_and(|p| at < p) {
        return Err(LifecycleError::OutOfOrder {
            stage,
            previous: previous_name,
        });
    }
    *slot = Some(at);
    Ok(())
}

/// All tasks issued by one crawl invocation, plus progress counters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub id: String,
    pub scans: BTreeSet<String>,
    pub ports: BTreeSet<u16>,
    /// Address specs as given by the caller (single, CIDR or dash range).
    pub targets: Vec<String>,
    pub total_issued: u64,
    pub remaining: u64,
    pub finished: u64,
}

impl ScanJob {
    pub fn new(
        id: impl Into<String>,
        scans: BTreeSet<String>,
        ports: BTreeSet<u16>,
        targets: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            scans,
            ports,
            targets,
            total_issued: 0,
            remaining: 0,
            finished: 0,
        }
    }
}

/// Aggregate over stored tasks, as reported by a persistence backend.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub total_tasks: u64,
    pub finished_tasks: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub earliest_created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub earliest_completed: Option<OffsetDateTime>,
}

/// Progress summary exposed by the master to its caller.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterStats {
    pub total_tasks: u64,
    pub finished_tasks: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub earliest_completion_timestamp: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub earliest_created_timestamp: Option<OffsetDateTime>,
}

impl From<PersistenceStats> for MasterStats {
    fn from(s: PersistenceStats) -> Self {
        Self {
            total_tasks: s.total_tasks,
            finished_tasks: s.finished_tasks,
            earliest_completion_timestamp: s.earliest_completed,
            earliest_created_timestamp: s.earliest_created,
        }
    }
}
