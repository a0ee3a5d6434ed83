//! Broker discovery provider (spec §1 out-of-scope collaborator:
//! `listActiveBrokers()`, `leastLoadedBroker()`). Shaped like
//! `pks-os-neon`'s control-plane provider trait, which likewise separates
//! a real provider from a `mock` test double behind one interface.

use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub service_url: String,
    pub service_url_tls: Option<String>,
}

impl BrokerTarget {
    /// Splits a `scheme://host:port` URL into its connectable parts,
    /// preferring the TLS URL when `prefer_tls` is set and available.
    pub fn host_port(&self, prefer_tls: bool) -> Result<(String, u16), DiscoveryError> {
        let url = if prefer_tls {
            self.service_url_tls.as_deref().unwrap_or(&self.service_url)
        } else {
            &self.service_url
        };
        let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
        let (host, port) = without_scheme
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::Metadata(format!("malformed broker url {url}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DiscoveryError::Metadata(format!("malformed broker port in {url}")))?;
        Ok((host.to_string(), port))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no broker available")]
    Unavailable,
    #[error("metadata store error: {0}")]
    Metadata(String),
}

/// The broker discovery / metadata-store collaborator (spec §1, §4.4).
#[async_trait]
pub trait BrokerDiscovery: Send + Sync {
    /// Resolves the broker owning `topic` (spec §4.4 step 2: "for lookups,
    /// the provider returns the owning broker (or, in redirect mode, any
    /// broker that can redirect)").
    async fn resolve_topic_owner(&self, topic: &str) -> Result<BrokerTarget, DiscoveryError>;

    /// Resolves a least-loaded broker, used for `PartitionedMetadata` and
    /// schema requests (spec §4.4 step 2).
    async fn least_loaded_broker(&self) -> Result<BrokerTarget, DiscoveryError>;

    async fn list_active_brokers(&self) -> Result<Vec<BrokerTarget>, DiscoveryError>;
}

/// A deterministic test double: topics are mapped to brokers by exact
/// match, falling back to a default broker; `least_loaded_broker` cycles
/// round-robin through the configured fleet.
pub struct MockDiscovery {
    topic_owners: DashMap<String, BrokerTarget>,
    default_broker: Option<BrokerTarget>,
    fleet: Vec<BrokerTarget>,
    next: std::sync::atomic::AtomicUsize,
}

impl MockDiscovery {
    pub fn new(fleet: Vec<BrokerTarget>) -> Self {
        MockDiscovery {
            topic_owners: DashMap::new(),
            default_broker: fleet.first().cloned(),
            fleet,
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn assign(&self, topic: impl Into<String>, broker: BrokerTarget) {
        self.topic_owners.insert(topic.into(), broker);
    }
}

#[async_trait]
impl BrokerDiscovery for MockDiscovery {
    async fn resolve_topic_owner(&self, topic: &str) -> Result<BrokerTarget, DiscoveryError> {
        if let Some(owner) = self.topic_owners.get(topic) {
            return Ok(owner.clone());
        }
        self.default_broker.clone().ok_or(DiscoveryError::Unavailable)
    }

    async fn least_loaded_broker(&self) -> Result<BrokerTarget, DiscoveryError> {
        if self.fleet.is_empty() {
            return Err(DiscoveryError::Unavailable);
        }
        let idx = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.fleet.len();
        Ok(self.fleet[idx].clone())
    }

    async fn list_active_brokers(&self) -> Result<Vec<BrokerTarget>, DiscoveryError> {
        Ok(self.fleet.clone())
    }
}

/// A discovery stub that never replies, used to exercise the lookup
/// semaphore exhaustion scenario (spec §8 seed test 3).
pub struct NeverRespondingDiscovery;

#[async_trait]
impl BrokerDiscovery for NeverRespondingDiscovery {
    async fn resolve_topic_owner(&self, _topic: &str) -> Result<BrokerTarget, DiscoveryError> {
        std::future::pending().await
    }

    async fn least_loaded_broker(&self) -> Result<BrokerTarget, DiscoveryError> {
        std::future::pending().await
    }

    async fn list_active_brokers(&self) -> Result<Vec<BrokerTarget>, DiscoveryError> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_discovery_resolves_assigned_topic() {
        let disc = MockDiscovery::new(vec![BrokerTarget {
            service_url: "pulsar://broker-a:6650".into(),
            service_url_tls: None,
        }]);
        disc.assign(
            "persistent://t/n/topic-0",
            BrokerTarget {
                service_url: "pulsar://broker-b:6650".into(),
                service_url_tls: None,
            },
        );
        let target = disc
            .resolve_topic_owner("persistent://t/n/topic-0")
            .await
            .unwrap();
        assert_eq!(target.service_url, "pulsar://broker-b:6650");
    }

    #[tokio::test]
    async fn mock_discovery_falls_back_to_default() {
        let disc = MockDiscovery::new(vec![BrokerTarget {
            service_url: "pulsar://broker-a:6650".into(),
            service_url_tls: None,
        }]);
        let target = disc.resolve_topic_owner("unassigned-topic").await.unwrap();
        assert_eq!(target.service_url, "pulsar://broker-a:6650");
    }
}
