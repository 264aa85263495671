use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;

use crate::address::{parse_cidr, parse_ipv4};

/// Addresses and CIDR blocks that must never be turned into scan tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    nets: Vec<Ipv4Net>,
}

impl Blacklist {
    pub fn new(nets: impl IntoIterator<Item = Ipv4Net>) -> Self {
        let mut nets: Vec<Ipv4Net> = nets.into_iter().collect();
        nets.sort();
        nets.dedup();
        Self { nets }
    }

    /// True when `addr` parses and lies within any entry. Unparseable input is never blacklisted.
    pub fn contains(&self, addr: &str) -> bool {
        parse_ipv4(addr).is_some_and(|ip| self.contains_addr(ip))
    }

    pub fn contains_addr(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|n| n.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

/// Parse blacklist file content.
///
/// One entry per line, either a single address or a CIDR block. Everything
/// after `#` is a comment; blank lines are ignored.
pub fn parse_blacklist_str(s: &str) -> Result<Blacklist> {
    let mut nets = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        if line.contains('-') {
            bail!("line {line_no}: dash ranges are not supported in a blacklist: {line}");
        }
        let net = if line.contains('/') {
            parse_cidr(line).with_context(|| format!("line {line_no}: invalid entry: {line}"))?
        } else {
            let ip = parse_ipv4(line)
                .with_context(|| format!("line {line_no}: invalid address: {line}"))?;
            Ipv4Net::from(ip)
        };
        nets.push(net);
    }
    Ok(Blacklist::new(nets))
}

pub fn load_blacklist_from_path(path: impl AsRef<Path>) -> Result<Blacklist> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read blacklist file: {}", path.as_ref().display()))?;
    parse_blacklist_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entries_with_comments() {
        let input = r#"
            # reserved
            10.0.0.0/8      # private
            192.168.1.7
        "#;
        let bl = parse_blacklist_str(input).unwrap();
        assert_eq!(bl.len(), 2);
        assert!(bl.contains("10.200.3.4"));
        assert!(bl.contains("192.168.1.7"));
        assert!(!bl.contains("192.168.1.8"));
    }

    #[test]
    fn whole_space_entry() {
        let bl = parse_blacklist_str("0.0.0.0/0\n").unwrap();
        assert!(bl.contains("8.8.8.8"));
    }

    #[test]
    fn cidr_entry_keeps_prefix_and_drops_host_bits() {
        let bl = parse_blacklist_str("10.1.2.3/24\n172.16.0.0/12\n").unwrap();
        assert!(bl.contains("10.1.2.200"));
        assert!(!bl.contains("10.1.3.0"));
        assert!(bl.contains("172.31.255.255"));
        assert!(!bl.contains("172.32.0.0"));
    }

    #[test]
    fn invalid_entry_errors() {
        assert!(parse_blacklist_str("10.0.0.300\n").is_err());
        assert!(parse_blacklist_str("10.0.0.1-10.0.0.5\n").is_err());
    }

    #[test]
    fn garbage_is_not_blacklisted() {
        let bl = parse_blacklist_str("0.0.0.0/0").unwrap();
        assert!(!bl.contains("not-an-ip"));
    }
}
