//! TLS termination at the listener (spec §4.1: "TLS ... terminates at this
//! layer"). A real client-side `rustls` connector, trusting a freshly
//! generated self-signed cert, completes a handshake against the proxy's
//! TLS port and runs the same Connect/Connected exchange as the plaintext
//! path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use broker_proxy::auth::NoAuthenticator;
use broker_proxy::authz::{AllowAllAuthorizer, Authorizer};
use broker_proxy::config::ProxyConfig;
use broker_proxy::discovery::{BrokerDiscovery, BrokerTarget, MockDiscovery};
use broker_proxy::protocol::command::Command;
use broker_proxy::protocol::frame::FrameCodec;
use broker_proxy::service::ProxyService;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

/// Generates a self-signed cert/key pair for "localhost" on disk, returning
/// the directory (so it can be cleaned up) and the two file paths.
fn self_signed_cert_files() -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed cert");
    let dir = std::env::temp_dir().join(format!("broker-proxy-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create cert dir");
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).expect("write cert");
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).expect("write key");
    (dir, cert_path, key_path)
}

fn client_config_trusting(cert_pem_path: &std::path::Path) -> rustls::ClientConfig {
    let pem = std::fs::read(cert_pem_path).expect("read cert for client trust store");
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .expect("parse cert");
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert).expect("add cert to trust store");
    }
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

#[tokio::test]
async fn tls_listener_completes_handshake_and_connect() {
    let (cert_dir, cert_path, key_path) = self_signed_cert_files();

    let plaintext_port = common::free_port().await;
    let tls_port = common::free_port().await;

    let mut config = ProxyConfig::default();
    config.bind_address = "127.0.0.1".to_string();
    config.service_port = plaintext_port;
    config.service_port_tls = Some(tls_port);
    config.tls.certificate = Some(cert_path);
    config.tls.private_key = Some(key_path);

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
    .expect("service starts with a valid TLS certificate configured");

    let tcp = common::connect_with_retry(tls_port).await;
    let client_config = client_config_trusting(&cert_dir.join("cert.pem"));
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("localhost".to_string()).unwrap();
    let tls_stream: tokio_rustls::client::TlsStream<TcpStream> = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS handshake with the listener succeeds");

    let mut framed = Framed::new(tls_stream, FrameCodec::new());
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

    drop(framed);
    service.shutdown_handle().request_shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), service.run_until_shutdown())
        .await
        .unwrap();

    let _ = std::fs::remove_dir_all(&cert_dir);
}
