//! Task generation.
//!
//! A [`Master`] turns a crawl request into scan tasks: it validates the
//! request, walks the address iterator, drops blacklisted targets, writes the
//! tasks in batches to persistence and the queue, and then waits until the
//! slaves have acknowledged every one of them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn, Instrument, Span};
use uuid::Uuid;

use crate::address::{parse_specs, AddressIterator, AddressRange};
use crate::error::{BackendError, CrawlError, ValidationError};
use crate::orchestration::OrchestrationProvider;
use crate::persistence::PersistenceProvider;
use crate::scans::ScanRegistry;
use crate::types::{MasterStats, ScanJob, ScanTarget, ScanTask};

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Tasks per `bulk_create`/`enqueue_many` round trip.
    pub batch_capacity: usize,
    /// How often `remaining_count` is polled while waiting for a job to drain.
    pub drain_poll: Duration,
    /// Give up waiting after this long. `None` waits forever.
    pub drain_timeout: Option<Duration>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 1000,
            drain_poll: Duration::from_secs(1),
            drain_timeout: None,
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRequest {
    pub scans: BTreeSet<String>,
    pub ports: BTreeSet<u16>,
}

/// What a finished `crawl` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub job_id: String,
    pub created: u64,
    pub blacklisted: u64,
    pub batches: u64,
}

pub struct Master {
    instance_id: String,
    orchestration: Arc<dyn OrchestrationProvider>,
    persistence: Arc<dyn PersistenceProvider>,
    scans: ScanRegistry,
    config: MasterConfig,
    span: Span,
}

impl Master {
    pub fn new(
        instance_id: impl Into<String>,
        orchestration: Arc<dyn OrchestrationProvider>,
        persistence: Arc<dyn PersistenceProvider>,
        scans: ScanRegistry,
        span: Span,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            orchestration,
            persistence,
            scans,
            config: MasterConfig::default(),
            span,
        }
    }

    pub fn with_config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Check scan names and ports, reporting every offender.
    pub fn validate(&self, scans: &[String], ports: &[u32]) -> Result<ValidRequest, ValidationError> {
        let mut err = ValidationError::default();
        if scans.is_empty() {
            err.missing.push("scans");
        }
        if ports.is_empty() {
            err.missing.push("ports");
        }
        for s in scans {
            if !self.scans.contains(s) && !err.invalid_scans.contains(s) {
                err.invalid_scans.push(s.clone());
            }
        }
        for &p in ports {
            if !(1..=65535).contains(&p) && !err.invalid_ports.contains(&p) {
                err.invalid_ports.push(p);
            }
        }
        if !err.is_empty() {
            return Err(err);
        }
        Ok(ValidRequest {
            scans: scans.iter().cloned().collect(),
            ports: ports.iter().map(|&p| p as u16).collect(),
        })
    }

    /// Like [`validate`](Self::validate), also parsing address specs.
    pub fn validate_with_targets<S: AsRef<str>>(
        &self,
        scans: &[String],
        specs: &[S],
        ports: &[u32],
    ) -> Result<(ValidRequest, Vec<AddressRange>), ValidationError> {
        let checked = self.validate(scans, ports);
        let ranges = parse_specs(specs);
        match (checked, ranges) {
            (Ok(req), Ok(ranges)) => Ok((req, ranges)),
            (checked, ranges) => {
                let mut err = checked.err().unwrap_or_default();
                err.invalid_targets = ranges.err().unwrap_or_default();
                Err(err)
            }
        }
    }

    /// Parse `specs` and crawl them with a fresh, memory-checkpointed iterator.
    pub async fn crawl_specs<S: AsRef<str>>(
        &self,
        scans: &[String],
        specs: &[S],
        ports: &[u32],
        job_id: &str,
    ) -> Result<CrawlReport, CrawlError> {
        let (_, ranges) = self.validate_with_targets(scans, specs, ports).map_err(|e| {
            self.span.in_scope(|| error!(job_id, %e, "crawl request rejected"));
            e
        })?;
        let mut targets = AddressIterator::new(ranges);
        self.crawl(scans, &mut targets, ports, job_id).await
    }

    /// Create, store and enqueue one task per non-blacklisted address, then
    /// wait for the job to drain.
    ///
    /// Nothing is created if validation fails. If generation fails midway the
    /// iterator checkpoint is left in place so a later run resumes; once the
    /// drain wait starts, the checkpoint is cleaned up whatever its outcome.
    pub async fn crawl(
        &self,
        scans: &[String],
        targets: &mut AddressIterator,
        ports: &[u32],
        job_id: &str,
    ) -> Result<CrawlReport, CrawlError> {
        self.run_crawl(scans, targets, ports, job_id)
            .instrument(self.span.clone())
            .await
    }

    async fn run_crawl(
        &self,
        scans: &[String],
        targets: &mut AddressIterator,
        ports: &[u32],
        job_id: &str,
    ) -> Result<CrawlReport, CrawlError> {
        let req = self.validate(scans, ports).map_err(|e| {
            error!(job_id, %e, "crawl request rejected");
            e
        })?;
        info!(job_id, scans = ?req.scans, ports = ?req.ports, addresses = targets.total(), "crawl started");

        let report = self.generate(&req, targets, job_id).await?;
        info!(job_id, created = report.created, blacklisted = report.blacklisted, batches = report.batches, "all scan tasks scheduled");

        let drained = self.wait_for_drain(job_id).await;
        if let Err(e) = &drained {
            error!(job_id, %e, "waiting for job to drain failed");
        }
        if let Err(e) = targets.cleanup() {
            warn!(job_id, %e, "failed to clean up address checkpoint");
        }
        drained?;

        self.orchestration.delete_job(job_id).await?;
        info!(job_id, "crawl finished");
        Ok(report)
    }

    async fn generate(
        &self,
        req: &ValidRequest,
        targets: &mut AddressIterator,
        job_id: &str,
    ) -> Result<CrawlReport, CrawlError> {
        if let Err(e) = self.orchestration.refresh_blacklist().await {
            warn!(%e, "blacklist refresh failed, using the cached copy");
        }

        let job = ScanJob::new(
            job_id,
            req.scans.clone(),
            req.ports.clone(),
            targets
                .ranges()
                .iter()
                .map(|r| format!("{}-{}", r.start(), r.end()))
                .collect(),
        );
        self.orchestration.put_job(job).await?;

        let mut report = CrawlReport {
            job_id: job_id.to_string(),
            ..CrawlReport::default()
        };
        let capacity = self.config.batch_capacity.max(1);
        let mut batch: Vec<ScanTask> = Vec::with_capacity(capacity);

        while targets.has_next() {
            let addr = targets.next()?;
            let target = ScanTarget {
                address: addr.to_string(),
                ports: req.ports.clone(),
            };
            if self.orchestration.is_blacklisted(&target).await {
                trace!(%addr, "skipping blacklisted target");
                report.blacklisted += 1;
                continue;
            }
            batch.push(ScanTask::new(
                job_id,
                self.instance_id.as_str(),
                target,
                req.scans.clone(),
            ));
            if batch.len() >= capacity {
                self.flush(job_id, &mut batch, targets, &mut report).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(job_id, &mut batch, targets, &mut report).await?;
        }
        // a blacklisted tail still has to be marked as consumed
        targets.commit()?;
        Ok(report)
    }

    async fn flush(
        &self,
        job_id: &str,
        batch: &mut Vec<ScanTask>,
        targets: &mut AddressIterator,
        report: &mut CrawlReport,
    ) -> Result<(), CrawlError> {
        self.persistence.bulk_create(batch).await?;
        let ids: Vec<Uuid> = batch.iter().map(|t| t.id).collect();
        self.orchestration.enqueue_many(job_id, &ids).await?;
        targets.commit()?;

        report.created += ids.len() as u64;
        report.batches += 1;
        debug!(job_id, size = ids.len(), checkpoint = ?targets.committed(), "flushed task batch");
        batch.clear();
        Ok(())
    }

    async fn wait_for_drain(&self, job_id: &str) -> Result<(), CrawlError> {
        let started = Instant::now();
        loop {
            let remaining = self.orchestration.remaining_count(job_id).await?;
            if remaining == 0 {
                return Ok(());
            }
            trace!(job_id, remaining, "waiting for job to drain");
            if let Some(timeout) = self.config.drain_timeout {
                if started.elapsed() >= timeout {
                    return Err(CrawlError::DrainTimeout {
                        job_id: job_id.to_string(),
                        timeout,
                    });
                }
            }
            time::sleep(self.config.drain_poll).await;
        }
    }

    /// Progress over every stored task.
    pub async fn get_stats(&self) -> Result<MasterStats, BackendError> {
        self.span.in_scope(|| trace!("get_stats"));
        Ok(self.persistence.stats(None).await?.into())
    }

    pub async fn get_job_stats(&self, job_id: &str) -> Result<MasterStats, BackendError> {
        Ok(self.persistence.stats(Some(job_id)).await?.into())
    }

    pub async fn list_jobs(&self) -> Result<Vec<ScanJob>, BackendError> {
        self.orchestration.list_jobs().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::InMemoryOrchestrationProvider;
    use crate::persistence::InMemoryPersistenceProvider;

    fn master() -> Master {
        Master::new(
            "master-test",
            Arc::new(InMemoryOrchestrationProvider::new()),
            Arc::new(InMemoryPersistenceProvider::new()),
            ScanRegistry::with_defaults(),
            Span::none(),
        )
    }

    #[test]
    fn validation_reports_all_offenders() {
        let m = master();
        let err = m
            .validate(
                &["null_scan".into(), "bogus_scan".into(), "nope".into()],
                &[443, 0, 70000, 0],
            )
            .unwrap_err();
        assert_eq!(err.invalid_scans, vec!["bogus_scan", "nope"]);
        assert_eq!(err.invalid_ports, vec![0, 70000]);
    }

    #[test]
    fn validation_rejects_empty_request() {
        let err = master().validate(&[], &[]).unwrap_err();
        assert_eq!(err.missing, vec!["scans", "ports"]);
    }

    #[test]
    fn validation_includes_targets() {
        let err = master()
            .validate_with_targets(&["bogus_scan".into()], &["10.0.0.1", "10.0.0.300"], &[443])
            .unwrap_err();
        assert_eq!(err.invalid_scans, vec!["bogus_scan"]);
        assert_eq!(err.invalid_targets, vec!["10.0.0.300"]);
    }

    #[test]
    fn valid_request_normalizes_ports() {
        let req = master()
            .validate(&["null_scan".into()], &[443, 80, 443])
            .unwrap();
        assert_eq!(req.ports, BTreeSet::from([80, 443]));
    }
}
