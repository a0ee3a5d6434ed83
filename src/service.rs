//! Service lifecycle owner (spec §4.7): builds every shared collaborator
//! once, binds the configured listeners, and drives startup/shutdown in
//! order. Grounded on `proxy-server`'s `main.rs`, which likewise constructs
//! its shared config/metrics/dispatch state once and spawns one accept loop
//! per configured listener.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::admission::ConnectionController;
use crate::auth::Authenticator;
use crate::authz::Authorizer;
use crate::config::ProxyConfig;
use crate::connection::ConnectionServices;
use crate::direct_proxy;
use crate::discovery::BrokerDiscovery;
use crate::dns::DnsResolver;
use crate::egress::BrokerProxyValidator;
use crate::lifecycle::{LifeCycle, ShutdownRequester};
use crate::listener;
use crate::metrics;
use crate::tls;
use crate::topic_stats::TopicStatsRegistry;

/// Owns every process-lifetime collaborator and the accept loops
/// (plaintext, and TLS if configured). Constructed once at startup and
/// driven to completion by `run_until_shutdown`.
pub struct ProxyService {
    config: Arc<ProxyConfig>,
    lifecycle: LifeCycle,
    dns: Arc<DnsResolver>,
    rollup_handle: JoinHandle<()>,
    listener_handles: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl ProxyService {
    /// Startup order (spec §4.7): construct the shared collaborators, then
    /// bind every configured listener. Fatal configuration problems (an
    /// unparsable bind address, a TLS port with no certificate configured)
    /// abort here rather than surfacing on the first accepted connection.
    pub async fn start(
        config: ProxyConfig,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
        discovery: Arc<dyn BrokerDiscovery>,
    ) -> anyhow::Result<Self> {
        metrics::init();

        let config = Arc::new(config);
        let dns = Arc::new(DnsResolver::from_system_config()?);
        let egress = Arc::new(BrokerProxyValidator::new(&config.egress)?);
        let admission = ConnectionController::new(
            config.max_concurrent_inbound_connections,
            config.max_concurrent_inbound_connections_per_ip,
        );
        let lookup_semaphore = Arc::new(Semaphore::new(config.max_concurrent_lookup_requests));
        let topic_stats = TopicStatsRegistry::new(config.max_tracked_topics);
        let backend_tls = Some(tls::build_connector(&config.tls)?);

        let lifecycle = LifeCycle::new();

        let services = ConnectionServices {
            config: config.clone(),
            admission,
            authenticator,
            authorizer,
            discovery,
            dns: dns.clone(),
            egress,
            topic_stats: topic_stats.clone(),
            lookup_semaphore,
            backend_tls,
            shutdown: lifecycle.subscribe(),
        };

        let mut listener_handles = Vec::new();

        let plaintext_addr = config.plaintext_addr()?;
        let plaintext_root_activity = lifecycle.activity(format!("listener {plaintext_addr}"));
        let plaintext_shutdown = lifecycle.subscribe();
        let plaintext_services = services.clone();
        listener_handles.push(tokio::spawn(async move {
            listener::run(
                plaintext_addr,
                None,
                plaintext_services,
                plaintext_root_activity,
                plaintext_shutdown,
            )
            .await
        }));

        if let Some(tls_addr) = config.tls_addr() {
            let tls_addr = tls_addr?;
            let acceptor = tls::build_acceptor(&config.tls)?;
            let tls_root_activity = lifecycle.activity(format!("listener {tls_addr}"));
            let tls_shutdown = lifecycle.subscribe();
            let tls_services = services.clone();
            listener_handles.push(tokio::spawn(async move {
                listener::run(
                    tls_addr,
                    Some(acceptor),
                    tls_services,
                    tls_root_activity,
                    tls_shutdown,
                )
                .await
            }));
        }

        let rollup_handle = topic_stats.spawn_rollup_task(direct_proxy::default_rollup_period());

        Ok(ProxyService {
            config,
            lifecycle,
            dns,
            rollup_handle,
            listener_handles,
        })
    }

    /// A handle that can request shutdown programmatically (e.g. from an
    /// admin endpoint), in addition to the SIGTERM/SIGINT path
    /// `wait_for_shutdown` already races against.
    pub fn shutdown_handle(&self) -> ShutdownRequester {
        self.lifecycle.request_handle()
    }

    /// Shutdown order (spec §4.7): stop accepting, let in-flight
    /// connections drain up to `shutdown_drain_deadline`, then tear down
    /// the background tasks and external collaborators.
    pub async fn run_until_shutdown(mut self) {
        let drain_deadline = self.config.shutdown_drain_deadline;
        self.lifecycle.wait_for_shutdown(drain_deadline).await;

        self.rollup_handle.abort();

        for handle in self.listener_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "listener exited with an error"),
                Err(err) => tracing::warn!(error = %err, "listener task panicked"),
            }
        }

        self.dns.shutdown().await;
        tracing::info!("proxy service stopped");
    }
}
