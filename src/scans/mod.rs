//! Pluggable scans.
//!
//! The core treats a scan as opaque: it has a name and produces a
//! [`ScanResult`] for a [`ScanTarget`]. Everything else (probing, parsing,
//! protocol logic) lives inside the implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::result::{is_reserved_key, ScanResult};
use crate::types::ScanTarget;

mod tcp_connect;

pub use tcp_connect::TcpConnectScan;

#[async_trait]
pub trait Scan: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, target: &ScanTarget) -> anyhow::Result<ScanResult>;
}

/// Does nothing but mark that it ran. Useful for exercising the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullScan;

impl NullScan {
    pub const NAME: &'static str = "null_scan";
}

#[async_trait]
impl Scan for NullScan {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, _target: &ScanTarget) -> anyhow::Result<ScanResult> {
        let mut r = ScanResult::new();
        r.add_string("scan", Self::NAME);
        Ok(r)
    }
}

/// Scans known to this process, by name.
#[derive(Clone, Default)]
pub struct ScanRegistry {
    scans: BTreeMap<String, Arc<dyn Scan>>,
}

impl std::fmt::Debug for ScanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.scans.keys()).finish()
    }
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `null_scan` and `tcp_connect` with default settings.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.scans.insert(NullScan::NAME.to_string(), Arc::new(NullScan));
        r.scans.insert(
            TcpConnectScan::NAME.to_string(),
            Arc::new(TcpConnectScan::default()),
        );
        r
    }

    /// Later registrations under the same name replace earlier ones.
    ///
    /// Empty names and names starting with `_` are refused.
    pub fn register(&mut self, scan: impl Scan + 'static) -> Result<&mut Self, RegistryError> {
        let name = scan.name();
        if is_reserved_key(name) {
            return Err(RegistryError::ReservedName(name.to_string()));
        }
        self.scans.insert(name.to_string(), Arc::new(scan));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scan>> {
        self.scans.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scans.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scans.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let r = ScanRegistry::with_defaults();
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["null_scan", "tcp_connect"]);
        assert!(r.contains("null_scan"));
        assert!(r.get("bogus_scan").is_none());
    }

    struct Named(&'static str);

    #[async_trait]
    impl Scan for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _target: &ScanTarget) -> anyhow::Result<ScanResult> {
            Ok(ScanResult::new())
        }
    }

    #[test]
    fn reserved_names_are_refused() {
        let mut r = ScanRegistry::new();
        for name in ["_result_id", "_error", "_anything", ""] {
            assert_eq!(
                r.register(Named(name)).err(),
                Some(RegistryError::ReservedName(name.to_string()))
            );
        }
        assert_eq!(r.names().count(), 0);

        r.register(Named("banner_grab")).unwrap();
        assert!(r.contains("banner_grab"));
    }

    #[tokio::test]
    async fn null_scan_marks_itself() {
        let r = NullScan.execute(&ScanTarget::new("10.0.0.1", [443])).await.unwrap();
        assert!(r.contains_key("scan"));
    }
}
