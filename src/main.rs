use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;

use broker_proxy::auth::{Authenticator, NoAuthenticator, Principal, StaticTokenAuthenticator};
use broker_proxy::authz::{AllowAllAuthorizer, Authorizer};
use broker_proxy::config::{Opt, ProxyConfig};
use broker_proxy::discovery::{BrokerDiscovery, BrokerTarget, MockDiscovery};
use broker_proxy::service::ProxyService;

/// Maps the `proxyLogLevel` knob (spec §6) onto a `tracing` filter
/// directive, unless `BROKER_PROXY_LOG` is set, in which case that wins.
fn init_logging(
    opt: &Opt,
    proxy_log_level: u8,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let directive = match proxy_log_level {
        0 => "off".to_string(),
        1 => "broker_proxy=info".to_string(),
        2 => "broker_proxy=debug".to_string(),
        _ => "broker_proxy=trace".to_string(),
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("BROKER_PROXY_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));

    match &opt.diag_log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "broker-proxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Builds the discovery collaborator from `--broker` flags. A real
/// deployment wires its own `BrokerDiscovery` against the cluster's
/// metadata store (spec §1: out of scope here); this lets the binary run
/// standalone against a fixed broker list.
fn build_discovery(opt: &Opt) -> Arc<dyn BrokerDiscovery> {
    let fleet: Vec<BrokerTarget> = opt
        .brokers
        .iter()
        .map(|b| BrokerTarget {
            service_url: b.clone(),
            service_url_tls: None,
        })
        .collect();
    Arc::new(MockDiscovery::new(fleet))
}

fn build_authenticator(opt: &Opt) -> Arc<dyn Authenticator> {
    match &opt.auth_token {
        Some(token) => Arc::new(StaticTokenAuthenticator {
            method_name: "token".to_string(),
            token: Bytes::copy_from_slice(token.as_bytes()),
            principal: Principal("static".to_string()),
        }),
        None => Arc::new(NoAuthenticator),
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let config = opt.resolve_config()?;
    let _log_guard = init_logging(&opt, config.proxy_log_level)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(opt, config))
}

async fn run(opt: Opt, config: ProxyConfig) -> anyhow::Result<()> {
    tracing::info!(
        bind = %config.bind_address,
        port = config.service_port,
        tls_port = ?config.service_port_tls,
        "starting broker-proxy",
    );

    let authenticator = build_authenticator(&opt);
    let authorizer: Arc<dyn Authorizer> = Arc::new(AllowAllAuthorizer);
    let discovery = build_discovery(&opt);

    let service = ProxyService::start(config, authenticator, authorizer, discovery).await?;
    service.run_until_shutdown().await;
    Ok(())
}
