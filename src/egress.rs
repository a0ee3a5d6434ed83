//! Egress validator (`BrokerProxyValidator`, spec §4.5).
//!
//! Three independent allow-lists all must pass: hostname glob, resolved-IP
//! CIDR, and target port. All three default to deny-all, so an unconfigured
//! proxy refuses every direct-splice target (spec §6, §8 boundary case).
//!
//! Hostname matching is grounded on `regex-set-map`'s approach of compiling
//! a set of user patterns into a `regex::RegexSet`; CIDR containment is
//! grounded on `cidr-map`'s use of the `cidr` crate.

use std::net::IpAddr;
use std::str::FromStr;

use cidr::IpCidr;
use regex::RegexSet;
use serde::{Deserialize, Deserializer};

use crate::dns::DnsResolver;
use crate::error::{ErrorKind, ProxyError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EgressAllowLists {
    /// Comma-separated glob patterns, e.g. "broker-*.example.com".
    #[serde(default)]
    pub allowed_host_names: Vec<String>,
    /// Comma-separated CIDR blocks, e.g. "10.0.0.0/8".
    #[serde(default)]
    pub allowed_ip_addresses: Vec<String>,
    /// Comma-separated port ranges, e.g. "6650,6651-6660".
    #[serde(default)]
    pub allowed_target_ports: Vec<String>,
}

/// Parses a comma-separated list from a single config string; accepted as
/// a convenience alternate input shape (matches the listener-config
/// description in spec §6, which documents these as comma-separated
/// strings rather than TOML arrays).
pub fn split_comma_list<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
    lo: u16,
    hi: u16,
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((lo, hi)) = s.split_once('-') {
            Ok(PortRange {
                lo: lo.trim().parse()?,
                hi: hi.trim().parse()?,
            })
        } else {
            let p: u16 = s.trim().parse()?;
            Ok(PortRange { lo: p, hi: p })
        }
    }
}

impl PortRange {
    fn contains(&self, port: u16) -> bool {
        port >= self.lo && port <= self.hi
    }
}

/// Translates a simple shell-style glob (`*` and `?`) into an anchored
/// regex, the same trick `regex-set-map` relies on for its pattern sets.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 2);
    out.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c if regex_syntax::is_meta_character(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

pub struct BrokerProxyValidator {
    host_patterns: RegexSet,
    host_patterns_configured: bool,
    ip_cidrs: Vec<IpCidr>,
    ip_allow_configured: bool,
    port_ranges: Vec<PortRange>,
    port_allow_configured: bool,
}

impl BrokerProxyValidator {
    pub fn new(lists: &EgressAllowLists) -> anyhow::Result<Self> {
        let host_patterns_configured = !lists.allowed_host_names.is_empty();
        let host_regexes: Vec<String> = lists
            .allowed_host_names
            .iter()
            .map(|g| glob_to_regex(g))
            .collect();
        let host_patterns = RegexSet::new(&host_regexes)?;

        let ip_allow_configured = !lists.allowed_ip_addresses.is_empty();
        let ip_cidrs = lists
            .allowed_ip_addresses
            .iter()
            .map(|c| c.parse::<IpCidr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("invalid CIDR in allow-list: {e}"))?;

        let port_allow_configured = !lists.allowed_target_ports.is_empty();
        let port_ranges = lists
            .allowed_target_ports
            .iter()
            .map(|p| p.parse::<PortRange>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BrokerProxyValidator {
            host_patterns,
            host_patterns_configured,
            ip_cidrs,
            ip_allow_configured,
            port_ranges,
            port_allow_configured,
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.host_patterns_configured && self.host_patterns.is_match(host)
    }

    fn ip_allowed(&self, ip: IpAddr) -> bool {
        self.ip_allow_configured && self.ip_cidrs.iter().any(|c| c.contains(&ip))
    }

    fn port_allowed(&self, port: u16) -> bool {
        self.port_allow_configured && self.port_ranges.iter().any(|r| r.contains(port))
    }

    /// Validates `(host, port)` against all three allow-lists (spec §4.5,
    /// §8). All three must be configured and must pass; a validator with
    /// any list empty rejects every target, which is the documented
    /// deny-all default (spec §6, §8 boundary behavior).
    pub async fn validate(
        &self,
        resolver: &DnsResolver,
        host: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        if !self.port_allowed(port) {
            return Err(ProxyError::reply(
                ErrorKind::ServiceNotReady,
                None,
                format!("port {port} is not in the egress allow-list"),
            ));
        }
        if !self.host_allowed(host) {
            return Err(ProxyError::reply(
                ErrorKind::ServiceNotReady,
                None,
                format!("host {host} is not in the egress allow-list"),
            ));
        }

        let resolved = resolver.resolve(host).await.map_err(|e| {
            ProxyError::reply(
                ErrorKind::ServiceNotReady,
                None,
                format!("DNS resolution for {host} failed: {e:#}"),
            )
        })?;

        if resolved.is_empty() || !resolved.iter().all(|ip| self.ip_allowed(*ip)) {
            return Err(ProxyError::reply(
                ErrorKind::ServiceNotReady,
                None,
                format!("resolved address for {host} is not in the egress allow-list"),
            ));
        }

        Ok(())
    }
}

mod regex_syntax {
    /// Characters that need escaping when translating a glob literal into a
    /// regex literal.
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '.' | '+'
                | '('
                | ')'
                | '|'
                | '['
                | ']'
                | '{'
                | '}'
                | '^'
                | '$'
                | '\\'
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(hosts: &[&str], cidrs: &[&str], ports: &[&str]) -> EgressAllowLists {
        EgressAllowLists {
            allowed_host_names: hosts.iter().map(|s| s.to_string()).collect(),
            allowed_ip_addresses: cidrs.iter().map(|s| s.to_string()).collect(),
            allowed_target_ports: ports.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn deny_all_by_default() {
        let v = BrokerProxyValidator::new(&EgressAllowLists::default()).unwrap();
        assert!(!v.host_allowed("broker-a.example.com"));
        assert!(!v.ip_allowed("10.0.0.1".parse().unwrap()));
        assert!(!v.port_allowed(6650));
    }

    #[test]
    fn glob_matches_prefix() {
        let v = BrokerProxyValidator::new(&lists(&["broker-*.example.com"], &[], &[])).unwrap();
        assert!(v.host_allowed("broker-a.example.com"));
        assert!(!v.host_allowed("broker-b.example.org"));
        assert!(!v.host_allowed("evilbroker-a.example.com"));
    }

    #[test]
    fn cidr_contains_address() {
        let v = BrokerProxyValidator::new(&lists(&[], &["10.0.0.0/8"], &[])).unwrap();
        assert!(v.ip_allowed("10.1.2.3".parse().unwrap()));
        assert!(!v.ip_allowed("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn port_range_is_inclusive() {
        let v = BrokerProxyValidator::new(&lists(&[], &[], &["6650", "7000-7010"])).unwrap();
        assert!(v.port_allowed(6650));
        assert!(v.port_allowed(7005));
        assert!(!v.port_allowed(7011));
    }
}
