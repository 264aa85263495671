//! Resumable enumeration over IPv4 address ranges.
//!
//! Address specs come in three shapes:
//! - a single address: `10.0.0.1`
//! - a CIDR block: `10.0.0.0/24` (`0.0.0.0/0` is the whole space)
//! - an inclusive dash range: `10.0.0.1-10.0.0.9`
//!
//! [`AddressIterator`] walks the ranges in ascending order of their start
//! address. Progress is made durable with [`AddressIterator::commit`]; a
//! resumed iterator continues right after the last committed address, so
//! anything yielded but not committed before a crash is produced again.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AddressError;

/// Parse a dotted-quad IPv4 address: four decimal components in `0..=255`.
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for slot in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u16 = part.parse().ok()?;
        *slot = u8::try_from(value).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

pub fn is_valid_ipv4(s: &str) -> bool {
    parse_ipv4(s).is_some()
}

/// Inclusive range `[start, end]` over the numeric encoding of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Option<Self> {
        let (start, end) = (u32::from(start), u32::from(end));
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(addr: Ipv4Addr) -> Self {
        let n = u32::from(addr);
        Self { start: n, end: n }
    }

    /// Every address of the block, network and broadcast included.
    pub fn from_net(net: Ipv4Net) -> Self {
        Self {
            start: u32::from(net.network()),
            end: u32::from(net.broadcast()),
        }
    }

    pub fn full() -> Self {
        Self {
            start: 0,
            end: u32::MAX,
        }
    }

    pub fn start(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let n = u32::from(addr);
        self.start <= n && n <= self.end
    }

    fn nth(&self, offset: u64) -> Ipv4Addr {
        Ipv4Addr::from((u64::from(self.start) + offset) as u32)
    }
}

/// Parse a CIDR block `a.b.c.d/nn`. Host bits are dropped, so `10.1.2.3/24` is `10.1.2.0/24`.
pub fn parse_cidr(spec: &str) -> Result<Ipv4Net, AddressError> {
    let spec = spec.trim();
    let malformed = || AddressError::Malformed(spec.to_string());

    let (addr, prefix) = spec.split_once('/').ok_or_else(malformed)?;
    let addr = parse_ipv4(addr.trim()).ok_or_else(malformed)?;
    let prefix = prefix.trim();
    if prefix.is_empty() || prefix.len() > 2 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let prefix: u8 = prefix.parse().map_err(|_| malformed())?;
    let net = Ipv4Net::new(addr, prefix).map_err(|_| malformed())?;
    Ok(net.trunc())
}

/// Parse one address spec into a range.
pub fn parse_spec(spec: &str) -> Result<AddressRange, AddressError> {
    let spec = spec.trim();
    let malformed = || AddressError::Malformed(spec.to_string());

    if spec.contains('/') {
        return parse_cidr(spec).map(AddressRange::from_net);
    }

    if let Some((a, b)) = spec.split_once('-') {
        let start = parse_ipv4(a.trim()).ok_or_else(malformed)?;
        let end = parse_ipv4(b.trim()).ok_or_else(malformed)?;
        return AddressRange::new(start, end).ok_or_else(malformed);
    }

    parse_ipv4(spec)
        .map(AddressRange::single)
        .ok_or_else(malformed)
}

/// Parse many specs, collecting every malformed one instead of stopping at the first.
pub fn parse_specs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<AddressRange>, Vec<String>> {
    let mut ranges = Vec::with_capacity(specs.len());
    let mut invalid = Vec::new();
    for spec in specs {
        match parse_spec(spec.as_ref()) {
            Ok(r) => ranges.push(r),
            Err(_) => invalid.push(spec.as_ref().trim().to_string()),
        }
    }
    if invalid.is_empty() {
        Ok(ranges)
    } else {
        Err(invalid)
    }
}

/// Split a targets file into specs: one per line, `#` starts a comment.
pub fn specs_from_str(s: &str) -> Vec<String> {
    s.lines()
        .map(|l| l.split('#').next().map(str::trim).unwrap_or(""))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Durable progress of an iterator: how many addresses were committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumed: u64,
    pub last: Option<Ipv4Addr>,
}

/// Where checkpoints are kept between runs.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Option<Checkpoint>, AddressError>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AddressError>;
    fn clear(&self) -> Result<(), AddressError>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, AddressError> {
        Ok(*self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AddressError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(*checkpoint);
        Ok(())
    }

    fn clear(&self) -> Result<(), AddressError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// JSON checkpoint file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Checkpoint>, AddressError> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), AddressError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(checkpoint)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), AddressError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Lazy, restartable walk over a set of address ranges.
pub struct AddressIterator {
    ranges: Vec<AddressRange>,
    range_idx: usize,
    offset: u64,
    yielded: u64,
    last: Option<Ipv4Addr>,
    committed: Checkpoint,
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for AddressIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressIterator")
            .field("ranges", &self.ranges.len())
            .field("yielded", &self.yielded)
            .field("committed", &self.committed)
            .finish()
    }
}

impl AddressIterator {
    /// A fresh iterator checkpointing to memory only.
    pub fn new(ranges: Vec<AddressRange>) -> Self {
        Self::build(ranges, Arc::new(MemoryCheckpointStore::new()))
    }

    /// Parse specs and build a fresh iterator over them.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, AddressError> {
        let ranges = specs
            .iter()
            .map(|s| parse_spec(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(ranges))
    }

    /// Continue after the checkpoint held by `store`, or from the beginning if it holds none.
    pub fn resume(
        ranges: Vec<AddressRange>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, AddressError> {
        let checkpoint = store.load()?;
        let mut it = Self::build(ranges, store);
        if let Some(cp) = checkpoint {
            it.skip_to(cp.consumed);
            it.last = cp.last;
            it.committed = cp;
            debug!(consumed = cp.consumed, last = ?cp.last, "resuming address iterator");
        }
        Ok(it)
    }

    fn build(mut ranges: Vec<AddressRange>, store: Arc<dyn CheckpointStore>) -> Self {
        ranges.sort();
        Self {
            ranges,
            range_idx: 0,
            offset: 0,
            yielded: 0,
            last: None,
            committed: Checkpoint::default(),
            store,
        }
    }

    fn skip_to(&mut self, mut n: u64) {
        self.yielded = n;
        while let Some(range) = self.ranges.get(self.range_idx) {
            if n < range.len() {
                self.offset = n;
                return;
            }
            n -= range.len();
            self.range_idx += 1;
        }
        self.offset = 0;
    }

    pub fn has_next(&self) -> bool {
        self.range_idx < self.ranges.len()
    }

    pub fn next(&mut self) -> Result<Ipv4Addr, AddressError> {
        let range = self
            .ranges
            .get(self.range_idx)
            .ok_or(AddressError::Exhausted)?;
        let addr = range.nth(self.offset);
        self.offset += 1;
        if self.offset == range.len() {
            self.range_idx += 1;
            self.offset = 0;
        }
        self.yielded += 1;
        self.last = Some(addr);
        Ok(addr)
    }

    /// Make everything returned so far durable. A no-op when nothing new was yielded.
    pub fn commit(&mut self) -> Result<(), AddressError> {
        let cp = Checkpoint {
            consumed: self.yielded,
            last: self.last,
        };
        if cp == self.committed {
            return Ok(());
        }
        self.store.save(&cp)?;
        self.committed = cp;
        Ok(())
    }

    /// Drop the durable checkpoint; the job it tracked is finished.
    pub fn cleanup(&mut self) -> Result<(), AddressError> {
        self.store.clear()
    }

    pub fn committed(&self) -> Checkpoint {
        self.committed
    }

    /// Total number of addresses across all ranges.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(AddressRange::len).sum()
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_parser_accepts_dotted_quads() {
        assert_eq!(parse_ipv4("10.0.0.1"), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parse_ipv4("255.255.255.255"), Some(Ipv4Addr::BROADCAST));
        assert_eq!(parse_ipv4("010.0.0.1"), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn explicit_parser_rejects_garbage() {
        for bad in ["", "10.0.0", "10.0.0.1.2", "256.0.0.1", "1..2.3", "a.b.c.d", "-1.0.0.0", "1000.0.0.1", " 1.2.3.4"] {
            assert!(parse_ipv4(bad).is_none(), "{bad} should be rejected");
        }
    }

    #[test]
    fn spec_shapes() {
        let r = parse_spec("192.168.1.0/30").unwrap();
        assert_eq!((r.start(), r.end(), r.len()), (Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(192, 168, 1, 3), 4));

        let r = parse_spec("10.0.0.5 - 10.0.0.7").unwrap();
        assert_eq!(r.len(), 3);

        assert_eq!(parse_spec("0.0.0.0/0").unwrap(), AddressRange::full());
        assert_eq!(AddressRange::full().len(), 1u64 << 32);

        // host bits are dropped
        assert_eq!(parse_spec("10.1.2.3/24").unwrap().start(), Ipv4Addr::new(10, 1, 2, 0));
    }

    #[test]
    fn cidr_keeps_its_prefix() {
        let net = parse_cidr("10.1.2.3/24").unwrap();
        assert_eq!((net.network(), net.prefix_len()), (Ipv4Addr::new(10, 1, 2, 0), 24));
        assert_eq!(parse_cidr(" 0.0.0.0/0 ").unwrap().prefix_len(), 0);
        for bad in ["10.0.0.1", "10.0.0.0/33", "10.0.0.0/", "10.0.0.300/8"] {
            assert!(parse_cidr(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn malformed_specs() {
        for bad in ["10.0.0.0/33", "10.0.0.0/", "10.0.0.9-10.0.0.1", "host.example", "10.0.0.0/2x"] {
            assert!(parse_spec(bad).is_err(), "{bad} should be rejected");
        }
        let err = parse_specs(&["10.0.0.1", "nope", "1.2.3.4/40"]).unwrap_err();
        assert_eq!(err, vec!["nope".to_string(), "1.2.3.4/40".to_string()]);
    }

    #[test]
    fn iterates_ranges_in_ascending_order() {
        let mut it = AddressIterator::from_specs(&["10.0.1.0-10.0.1.1", "10.0.0.254/31"]).unwrap();
        let mut seen = Vec::new();
        while it.has_next() {
            seen.push(it.next().unwrap().to_string());
        }
        assert_eq!(seen, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
        assert!(matches!(it.next(), Err(AddressError::Exhausted)));
    }

    #[test]
    fn end_of_address_space_does_not_overflow() {
        let mut it = AddressIterator::from_specs(&["255.255.255.254-255.255.255.255"]).unwrap();
        assert_eq!(it.next().unwrap(), Ipv4Addr::new(255, 255, 255, 254));
        assert_eq!(it.next().unwrap(), Ipv4Addr::BROADCAST);
        assert!(!it.has_next());
    }

    #[test]
    fn specs_file_ignores_comments() {
        let specs = specs_from_str("# targets\n10.0.0.1\n\n10.0.1.0/24  # lab\n");
        assert_eq!(specs, vec!["10.0.0.1", "10.0.1.0/24"]);
    }
}
