use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use super::Scan;
use crate::address::parse_ipv4;
use crate::result::{ResultArray, ScanResult};
use crate::types::ScanTarget;

/// Outcome of one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortProbe {
    port: u16,
    open: bool,
    latency_ms: u64,
    banner: Option<String>,
}

/// TCP connect probe of every port on the target, with a short passive banner grab.
///
/// - Limits concurrent socket attempts per target using a `Semaphore`.
/// - Bounds each connect with `tokio::time::timeout`.
/// - On success, reads up to 256 bytes within `banner_timeout`.
#[derive(Debug, Clone)]
pub struct TcpConnectScan {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub concurrency: usize,
}

impl Default for TcpConnectScan {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(400),
            banner_timeout: Duration::from_millis(200),
            concurrency: 64,
        }
    }
}

impl TcpConnectScan {
    pub const NAME: &'static str = "tcp_connect";

    async fn probe_all(&self, ip: IpAddr, ports: &[u16]) -> Vec<PortProbe> {
        let sem = Arc::new(Semaphore::new(self.concurrency.clamp(1, 5_000)));
        let mut set = JoinSet::new();

        for &port in ports {
            let sem = Arc::clone(&sem);
            let connect_timeout = self.connect_timeout;
            let banner_timeout = self.banner_timeout;
            set.spawn(async move {
                // the semaphore is never closed
                let _permit = sem.acquire_owned().await.ok();
                probe(SocketAddr::new(ip, port), connect_timeout, banner_timeout).await
            });
        }

        let mut probes = Vec::with_capacity(ports.len());
        while let Some(res) = set.join_next().await {
            if let Ok(p) = res {
                probes.push(p);
            }
        }
        probes.sort_by_key(|p| p.port);
        probes
    }
}

#[async_trait]
impl Scan for TcpConnectScan {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, target: &ScanTarget) -> Result<ScanResult> {
        let ip = parse_ipv4(&target.address)
            .map(IpAddr::V4)
            .ok_or_else(|| anyhow!("not an IPv4 address: {}", target.address))?;
        let ports: Vec<u16> = target.ports.iter().copied().collect();
        let probes = self.probe_all(ip, &ports).await;

        let mut result = ScanResult::new();
        let open: Vec<i64> = probes
            .iter()
            .filter(|p| p.open)
            .map(|p| i64::from(p.port))
            .collect();
        result.add_integer("probed", probes.len() as i64);
        result.add_array("open_ports", ResultArray::Integers(open));
        for p in probes.iter().filter(|p| p.open) {
            let mut entry = ScanResult::new();
            entry.add_integer("latency_ms", p.latency_ms as i64);
            if let Some(b) = &p.banner {
                entry.add_string("banner", b.clone());
            }
            result.add_nested(p.port.to_string(), entry);
        }
        Ok(result)
    }
}

async fn probe(addr: SocketAddr, connect_timeout: Duration, banner_timeout: Duration) -> PortProbe {
    let start = Instant::now();
    match time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(mut stream)) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let banner = read_banner(&mut stream, banner_timeout).await;
            PortProbe {
                port: addr.port(),
                open: true,
                latency_ms,
                banner,
            }
        }
        // closed, filtered or timed out
        _ => PortProbe {
            port: addr.port(),
            open: false,
            latency_ms: 0,
            banner: None,
        },
    }
}

/// Try to read up to 256 bytes with a short timeout and convert to a lossy UTF-8 string.
async fn read_banner(stream: &mut TcpStream, timeout: Duration) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).to_string();
            Some(s.replace('\n', "\\n").replace('\r', "\\r"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultValue;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn finds_open_port_and_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"SSH-2.0-test\r\n").await;
            }
        });

        let scan = TcpConnectScan::default();
        let r = scan
            .execute(&ScanTarget::new("127.0.0.1", [port]))
            .await
            .unwrap();
        assert_eq!(
            r.get("open_ports"),
            Some(&ResultValue::Array(ResultArray::Integers(vec![i64::from(port)])))
        );
        match r.get(&port.to_string()) {
            Some(ResultValue::Nested(entry)) => {
                assert_eq!(
                    entry.get("banner"),
                    Some(&ResultValue::String("SSH-2.0-test\\r\\n".into()))
                );
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_non_ipv4_target() {
        let err = TcpConnectScan::default()
            .execute(&ScanTarget::new("example.org", [80]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an IPv4 address"));
    }
}
