//! Seed test 2 (spec §8): with `maxConcurrentInboundConnections = 2`, three
//! simultaneous connects result in exactly two admitted and one closed
//! immediately by the admission layer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::auth::NoAuthenticator;
use broker_proxy::authz::{AllowAllAuthorizer, Authorizer};
use broker_proxy::config::ProxyConfig;
use broker_proxy::discovery::{BrokerDiscovery, BrokerTarget, MockDiscovery};
use broker_proxy::metrics;
use broker_proxy::service::ProxyService;
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn admission_cap_of_two_rejects_a_third_simultaneous_connection() {
    let rejected_before = metrics::REJECTED_CONNECTIONS.get();

    let port = common::free_port().await;
    let mut config = ProxyConfig::default();
    config.bind_address = "127.0.0.1".to_string();
    config.service_port = port;
    config.max_concurrent_inbound_connections = Some(2);

    let discovery: Arc<dyn BrokerDiscovery> = Arc::new(MockDiscovery::new(vec![BrokerTarget {
        service_url: "pulsar://127.0.0.1:1".to_string(),
        service_url_tls: None,
    }]));

    let service = ProxyService::start(
        config,
        Arc::new(NoAuthenticator),
        Arc::new(AllowAllAuthorizer) as Arc<dyn Authorizer>,
        discovery,
    )
    .await
    .unwrap();

    let _first = common::connect_with_retry(port).await;
    let _second = common::connect_with_retry(port).await;
    let mut third = common::connect_with_retry(port).await;

    // Let the accept loop process all three connections in order before
    // inspecting the outcome.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut buf = [0u8; 1];
    let n = third.read(&mut buf).await.unwrap_or(0);
    assert_eq!(
        n, 0,
        "the third connection should be closed by the admission layer without sending any data"
    );
    assert_eq!(
        metrics::REJECTED_CONNECTIONS.get(),
        rejected_before + 1
    );

    service.shutdown_handle().request_shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), service.run_until_shutdown())
        .await
        .unwrap();
}
