//! Seed test 1 (spec §8): a `Lookup` reply is rewritten to point back
//! through the proxy's own advertised URL, with the real broker target
//! stashed alongside for the later splice transition.

mod common;

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::auth::{NoAuthenticator, Principal};
use broker_proxy::authz::{AllowAllAuthorizer, Authorizer};
use broker_proxy::config::ProxyConfig;
use broker_proxy::discovery::{BrokerDiscovery, BrokerTarget, MockDiscovery};
use broker_proxy::lookup::{handle_lookup_family, LookupServices};
use broker_proxy::protocol::command::{Command, LookupType};
use broker_proxy::protocol::frame::FrameCodec;
use broker_proxy::service::ProxyService;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;

fn lookup_services(advertised: &str) -> LookupServices {
    LookupServices {
        semaphore: Arc::new(Semaphore::new(4)),
        discovery: Arc::new(MockDiscovery::new(vec![BrokerTarget {
            service_url: "pulsar://broker-a:6650".to_string(),
            service_url_tls: None,
        }])),
        authorizer: Arc::new(AllowAllAuthorizer),
        require_authorization: false,
        advertised_service_url: advertised.to_string(),
        lookup_request_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn lookup_reply_points_through_the_proxys_own_url() {
    let services = lookup_services("pulsar://proxy.example:6650");
    let principal = Principal("test-client".to_string());

    let (reply, target) = handle_lookup_family(
        &services,
        &principal,
        Command::Lookup {
            request_id: 1,
            topic: "persistent://t/n/topic-0".to_string(),
            authoritative: false,
        },
    )
    .await;

    match reply {
        Command::LookupResponse {
            request_id,
            response_type,
            broker_service_url,
            proxy_through_service_url,
            authoritative,
            ..
        } => {
            assert_eq!(request_id, 1);
            assert_eq!(response_type, LookupType::Connect);
            assert_eq!(
                broker_service_url.as_deref(),
                Some("pulsar://proxy.example:6650")
            );
            assert!(proxy_through_service_url);
            assert!(authoritative);
        }
        other => panic!("expected LookupResponse, got {other:?}"),
    }

    let target =
        target.expect("a topic Lookup resolves a broker target to stash on the connection");
    assert_eq!(target.service_url, "pulsar://broker-a:6650");
    assert_eq!(services.semaphore.available_permits(), 4);
}

#[tokio::test]
async fn end_to_end_lookup_through_a_real_listener() {
    let port = common::free_port().await;
    let mut config = ProxyConfig::default();
    config.bind_address = "127.0.0.1".to_string();
    config.service_port = port;
    config.advertised_address = Some("proxy.example".to_string());

    let discovery: Arc<dyn BrokerDiscovery> = Arc::new(MockDiscovery::new(vec![BrokerTarget {
        service_url: "pulsar://broker-a:6650".to_string(),
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

    let stream = common::connect_with_retry(port).await;
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

    framed
        .send(Command::Lookup {
            request_id: 7,
            topic: "persistent://t/n/topic-0".to_string(),
            authoritative: false,
        })
        .await
        .unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    match reply.command {
        Command::LookupResponse {
            request_id,
            broker_service_url,
            proxy_through_service_url,
            ..
        } => {
            assert_eq!(request_id, 7);
            assert_eq!(
                broker_service_url.as_deref(),
                Some(format!("pulsar://proxy.example:{port}").as_str())
            );
            assert!(proxy_through_service_url);
        }
        other => panic!("expected LookupResponse, got {other:?}"),
    }

    drop(framed);
    service.shutdown_handle().request_shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), service.run_until_shutdown())
        .await
        .unwrap();
}
