//! Seed test 5 (spec §8): the first data-plane command triggers the splice
//! transition; once the backend socket is up, bytes flow both ways
//! untouched, and closing the client side propagates through to the
//! backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::auth::NoAuthenticator;
use broker_proxy::authz::{AllowAllAuthorizer, Authorizer};
use broker_proxy::config::ProxyConfig;
use broker_proxy::discovery::{BrokerDiscovery, BrokerTarget, MockDiscovery};
use broker_proxy::egress::EgressAllowLists;
use broker_proxy::protocol::command::Command;
use broker_proxy::protocol::frame::FrameCodec;
use broker_proxy::service::ProxyService;
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

#[tokio::test]
async fn splice_carries_the_triggering_frame_and_its_reply() {
    let broker_port = common::spawn_echo_broker().await;
    let proxy_port = common::free_port().await;

    let mut config = ProxyConfig::default();
    config.bind_address = "127.0.0.1".to_string();
    config.service_port = proxy_port;
    config.egress = EgressAllowLists {
        allowed_host_names: vec!["127.0.0.1".to_string()],
        allowed_ip_addresses: vec!["127.0.0.1/32".to_string()],
        allowed_target_ports: vec![broker_port.to_string()],
    };

    let discovery: Arc<dyn BrokerDiscovery> = Arc::new(MockDiscovery::new(vec![BrokerTarget {
        service_url: format!("pulsar://127.0.0.1:{broker_port}"),
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

    let stream = common::connect_with_retry(proxy_port).await;
    let mut framed = Framed::new(stream, FrameCodec::new());

    framed
        .send(Command::Connect {
            protocol_version: 13,
            proxy_to_broker_url: None,
            auth_method_name: None,
            auth_data: None,
        })
        .await
        .unwrap();
    let connected = framed.next().await.unwrap().unwrap();
    assert!(matches!(connected.command, Command::Connected { .. }));

    // `Send` is a data-plane command: it triggers the proxy's connect to the
    // backend and is itself the first frame flushed to it. The echo broker
    // reflects the exact bytes straight back.
    framed
        .send(Command::Send {
            producer_id: 1,
            sequence_id: 1,
        })
        .await
        .unwrap();

    let echoed = framed.next().await.unwrap().unwrap();
    match echoed.command {
        Command::Send {
            producer_id,
            sequence_id,
        } => {
            assert_eq!(producer_id, 1);
            assert_eq!(sequence_id, 1);
        }
        other => panic!("expected the echo broker's reflection of Send, got {other:?}"),
    }

    // Closing the client side should propagate through the splice and let
    // the connection's task (and its Activity) finish promptly.
    drop(framed);

    service.shutdown_handle().request_shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), service.run_until_shutdown())
        .await
        .expect("shutdown should complete once the spliced connection has closed");
}
