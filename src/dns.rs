//! DNS resolver (spec §4.6): caches A/AAAA lookups but forces both
//! positive and negative TTL down to a short value so backend rotations
//! are picked up quickly. Grounded on `dns-resolver`'s
//! `hickory-resolver`-backed resolver, minus the `unbound` backend and the
//! `lruttl`-based external cache (hickory's own resolver cache already
//! honors a TTL override, so there is nothing left for a second cache
//! layer to do).

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

/// Forced TTL floor/ceiling (spec §4.6: "forces both down to short values
/// (1 s)").
const FORCED_TTL_SECONDS: u32 = 1;

pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    /// One resolver instance per worker group (spec §4.6); constructing it
    /// from the system config keeps behavior consistent with whatever
    /// resolv.conf the host has, with the TTL override layered on top.
    pub fn from_system_config() -> anyhow::Result<Self> {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, opts)) => (config, opts),
            Err(_) => (ResolverConfig::default(), ResolverOpts::default()),
        };
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        opts.positive_min_ttl = Some(Duration::from_secs(FORCED_TTL_SECONDS as u64));
        opts.positive_max_ttl = Some(Duration::from_secs(FORCED_TTL_SECONDS as u64));
        opts.negative_min_ttl = Some(Duration::from_secs(FORCED_TTL_SECONDS as u64));
        opts.negative_max_ttl = Some(Duration::from_secs(FORCED_TTL_SECONDS as u64));
        opts.cache_size = 4096;

        Ok(DnsResolver {
            inner: TokioAsyncResolver::tokio(config, opts),
        })
    }

    /// Resolves a hostname to all of its A/AAAA addresses. If `host` is
    /// already a literal IP address, returns it directly without a lookup.
    pub async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let response = self.inner.lookup_ip(host).await?;
        Ok(response.iter().collect())
    }

    /// Called during `ProxyService` shutdown (spec §4.7); hickory's
    /// resolver has no persistent handle to release, but the method exists
    /// so callers don't need to know that.
    pub async fn shutdown(&self) {}
}
