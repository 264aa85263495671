use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use netcrawl_rs::address::{specs_from_str, AddressIterator, FileCheckpointStore};
use netcrawl_rs::master::{Master, MasterConfig};
use netcrawl_rs::orchestration::{InMemoryOrchestrationProvider, OrchestrationProvider};
use netcrawl_rs::persistence::{InMemoryPersistenceProvider, PersistenceProvider};
use netcrawl_rs::scans::{NullScan, ScanRegistry, TcpConnectScan};
use netcrawl_rs::server::{self, AppState};
use netcrawl_rs::slave::{Slave, SlaveConfig};

/// netcrawl-rs: distributes network scans over a pool of workers through a shared task queue.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "netcrawl-rs",
    version,
    about = "Distributes network scans over a pool of workers through a shared task queue.",
    long_about = None
)]
struct Cli {
    /// ID of this crawler instance, recorded as the creator of every task. Random if omitted.
    #[arg(long = "instance-id")]
    instance_id: Option<String>,

    /// Instances in the same workspace share the same backends.
    #[arg(long)]
    workspace: Option<String>,

    /// Comma separated scan names to run on every target.
    #[arg(long, default_value = "null_scan")]
    scans: String,

    /// Comma separated ports or ranges (e.g. 22,80,8000-8010).
    #[arg(long, default_value = "443")]
    ports: String,

    /// Comma separated address specs (IP, CIDR or a-b range), or @path to a file with one per line.
    #[arg(long)]
    targets: Option<String>,

    /// Path to a blacklist file of IPs/CIDR blocks, re-read at the start of every crawl.
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// Number of worker tasks executing scans.
    #[arg(long, default_value_t = 64)]
    threads: usize,

    /// Tasks per persistence/queue round trip.
    #[arg(long = "batch-size", default_value_t = 1000)]
    batch_size: usize,

    /// Socket connect timeout in milliseconds for tcp_connect.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Checkpoint file; an interrupted crawl resumes after the last committed address.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Redeliver tasks not acknowledged within this many seconds.
    #[arg(long = "lease-secs")]
    lease_secs: Option<u64>,

    /// Stop waiting for the job to drain after this many seconds.
    #[arg(long = "drain-timeout-secs")]
    drain_timeout_secs: Option<u64>,

    /// Job ID for the crawl. Random if omitted.
    #[arg(long = "job-id")]
    job_id: Option<String>,

    /// Write every task with its result as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the HTTP API on this address instead of running a single crawl.
    #[arg(long)]
    serve: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,netcrawl_rs=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let instance_id = cli.instance_id.clone().unwrap_or_else(|| {
        let id = Uuid::new_v4().to_string();
        info!(instance_id = %id, "no instance id set, generated one");
        id
    });
    let workspace = cli.workspace.clone().unwrap_or_else(|| {
        warn!("no workspace name set, using default workspace");
        "default".to_string()
    });
    info!(
        %instance_id,
        %workspace,
        scans = %cli.scans,
        ports = %cli.ports,
        targets = cli.targets.as_deref().unwrap_or("<none>"),
        threads = cli.threads,
        batch_size = cli.batch_size,
        "netcrawl-rs configuration"
    );

    let mut orchestration = InMemoryOrchestrationProvider::new();
    if let Some(path) = &cli.blacklist {
        orchestration = orchestration.with_blacklist_file(path);
    }
    if let Some(secs) = cli.lease_secs {
        orchestration = orchestration.with_lease(Duration::from_secs(secs));
    }
    let orchestration: Arc<dyn OrchestrationProvider> = Arc::new(orchestration);
    let store = Arc::new(InMemoryPersistenceProvider::new());
    let persistence: Arc<dyn PersistenceProvider> = store.clone();

    if let Err(e) = orchestration.ping().await {
        error!(%e, "connecting to the orchestration backend failed");
        return Err(e).context("orchestration backend unreachable");
    }
    if let Err(e) = persistence.ping().await {
        error!(%e, "connecting to the persistence backend failed");
        return Err(e).context("persistence backend unreachable");
    }

    let mut scans = ScanRegistry::new();
    scans.register(NullScan)?.register(TcpConnectScan {
        connect_timeout: Duration::from_millis(cli.timeout_ms),
        ..TcpConnectScan::default()
    })?;

    let root = info_span!("crawler", %instance_id, %workspace);
    let slave = Arc::new(Slave::new(
        orchestration.clone(),
        persistence.clone(),
        scans.clone(),
        SlaveConfig {
            workers: cli.threads,
            ..SlaveConfig::default()
        },
        info_span!(parent: &root, "slave"),
    ));
    let master = Arc::new(
        Master::new(
            instance_id.clone(),
            orchestration.clone(),
            persistence.clone(),
            scans,
            info_span!(parent: &root, "master"),
        )
        .with_config(MasterConfig {
            batch_capacity: cli.batch_size,
            drain_timeout: cli.drain_timeout_secs.map(Duration::from_secs),
            ..MasterConfig::default()
        }),
    );

    let cancel = CancellationToken::new();
    let slave_handle = tokio::spawn(Arc::clone(&slave).run(cancel.clone()));

    let outcome = match cli.serve.as_deref() {
        Some(bind) => {
            tokio::select! {
                res = server::spawn_server(bind, AppState::new(Arc::clone(&master))) => res,
                _ = tokio::signal::ctrl_c() => Ok(()),
            }
        }
        None => run_crawl(&cli, &master).await,
    };

    cancel.cancel();
    if let Err(e) = slave_handle.await {
        error!(%e, "slave task failed");
    }

    let stats = master.get_stats().await?;
    info!(
        total = stats.total_tasks,
        finished = stats.finished_tasks,
        earliest_created = ?stats.earliest_created_timestamp,
        earliest_completed = ?stats.earliest_completion_timestamp,
        "final stats"
    );

    if let Some(path) = cli.output.as_deref() {
        match store.write_tasks_json(path) {
            Ok(()) => info!("wrote JSON results to {}", path.display()),
            Err(e) => error!("failed to write JSON to {}: {e:#}", path.display()),
        }
    }

    outcome
}

async fn run_crawl(cli: &Cli, master: &Master) -> Result<()> {
    let Some(targets) = cli.targets.as_deref() else {
        bail!("--targets is required unless --serve is given");
    };
    let specs = load_specs(targets)?;
    let scans: Vec<String> = split_list(&cli.scans).map(str::to_string).collect();
    let ports = parse_port_list(&cli.ports)?;
    let job_id = cli
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (_, ranges) = master
        .validate_with_targets(&scans, &specs, &ports)
        .context("crawl request rejected")?;
    let mut iter = match &cli.checkpoint {
        Some(path) => AddressIterator::resume(ranges, Arc::new(FileCheckpointStore::new(path)))?,
        None => AddressIterator::new(ranges),
    };

    tokio::select! {
        res = master.crawl(&scans, &mut iter, &ports, &job_id) => {
            let report = res?;
            info!(job_id = %report.job_id, created = report.created, blacklisted = report.blacklisted, "crawl complete");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!(%job_id, checkpoint = ?cli.checkpoint, "interrupted; rerun with the same checkpoint to resume");
        }
    }
    Ok(())
}

fn load_specs(targets: &str) -> Result<Vec<String>> {
    match targets.strip_prefix('@') {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read targets file: {path}"))?;
            Ok(specs_from_str(&content))
        }
        None => Ok(split_list(targets).map(str::to_string).collect()),
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty())
}

/// Parse `22,80,8000-8010` into raw port numbers. Range checks are left to crawl validation.
fn parse_port_list(s: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    for item in split_list(s) {
        if let Some((a, b)) = item.split_once('-') {
            let start: u32 = a.trim().parse().with_context(|| format!("invalid port: {a}"))?;
            let end: u32 = b.trim().parse().with_context(|| format!("invalid port: {b}"))?;
            if start > end {
                bail!("invalid port range {start}-{end} (start > end)");
            }
            out.extend(start..=end);
        } else {
            out.push(item.parse().with_context(|| format!("invalid port: {item}"))?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_list_with_ranges() {
        assert_eq!(parse_port_list("22, 80,8000-8002").unwrap(), vec![22, 80, 8000, 8001, 8002]);
    }

    #[test]
    fn port_list_keeps_out_of_range_for_validation() {
        assert_eq!(parse_port_list("0,70000").unwrap(), vec![0, 70000]);
        assert!(parse_port_list("http").is_err());
        assert!(parse_port_list("90-80").is_err());
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::parse_from(["netcrawl-rs", "--targets", "10.0.0.0/30", "--ports", "443,8443"]);
        assert_eq!(cli.threads, 64);
        assert_eq!(cli.scans, "null_scan");
        assert_eq!(load_specs(cli.targets.as_deref().unwrap()).unwrap(), vec!["10.0.0.0/30"]);
    }
}
