//! Error types shared across the crawler core.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failures of the address enumeration layer.
#[derive(Debug, Error)]
pub enum AddressError {
    /// `next()` was called after `has_next()` returned false.
    #[error("address iterator exhausted")]
    Exhausted,

    /// An address spec could not be parsed.
    #[error("malformed address spec: {0}")]
    Malformed(String),

    /// Reading or writing the checkpoint failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The checkpoint file did not contain a valid checkpoint.
    #[error("checkpoint decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// An attempt to move a task timestamp backwards or set it twice.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{0} timestamp already set")]
    AlreadySet(&'static str),

    #[error("{stage} timestamp precedes {previous}")]
    OutOfOrder {
        stage: &'static str,
        previous: &'static str,
    },
}

/// Every problem found in a crawl request, collected before any task exists.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub invalid_scans: Vec<String>,
    pub invalid_ports: Vec<u32>,
    pub invalid_targets: Vec<String>,
    /// Request parts that must not be empty but were (`"scans"`, `"ports"`).
    pub missing: Vec<&'static str>,
}

impl ValidationError {
    pub fn is_empty(&self) -> bool {
        self.invalid_scans.is_empty()
            && self.invalid_ports.is_empty()
            && self.invalid_targets.is_empty()
            && self.missing.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn quoted<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| format!("'{i}'"))
                .collect::<Vec<_>>()
                .join(" ")
        }

        let mut parts: Vec<String> = self.missing.iter().map(|m| format!("no {m} given")).collect();
        if !self.invalid_scans.is_empty() {
            parts.push(format!("invalid scans: {}", quoted(&self.invalid_scans)));
        }
        if !self.invalid_ports.is_empty() {
            parts.push(format!("invalid ports: {}", quoted(&self.invalid_ports)));
        }
        if !self.invalid_targets.is_empty() {
            parts.push(format!("invalid targets: {}", quoted(&self.invalid_targets)));
        }
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// A scan that cannot be registered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Scan output is stored under the scan's name, so names starting with
    /// `_` (or empty) would collide with the crawler's own result keys.
    #[error("reserved scan name: '{0}'")]
    ReservedName(String),
}

/// Failures surfaced by a backend (orchestration or persistence).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top level error of a `crawl` invocation.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("crawl request rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("job {job_id} did not drain within {timeout:?}")]
    DrainTimeout { job_id: String, timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_lists_everything() {
        let err = ValidationError {
            invalid_scans: vec!["bogus_scan".into(), "other".into()],
            invalid_ports: vec![0, 70000],
            invalid_targets: vec![],
            missing: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("'bogus_scan' 'other'"));
        assert!(msg.contains("'0' '70000'"));
        assert!(!msg.contains("targets"));
    }
}
