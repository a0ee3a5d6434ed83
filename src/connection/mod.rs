//! Per-connection driver (spec §3, §4.2, §4.3). One `ProxyConnection` is
//! created per accepted socket and runs to completion on the task it was
//! spawned on; `drive_connection` is the state machine itself.

pub mod state;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::Either;
use futures_util::SinkExt;
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::admission::{AdmissionPermit, ConnectionController};
use crate::auth::{AuthOutcome, Authenticator, Principal};
use crate::authz::Authorizer;
use crate::config::ProxyConfig;
use crate::direct_proxy::{self, DirectProxyHandler, SpliceConfig};
use crate::discovery::{BrokerDiscovery, BrokerTarget};
use crate::dns::DnsResolver;
use crate::egress::BrokerProxyValidator;
use crate::error::ErrorKind;
use crate::lifecycle::ShutdownSubscription;
use crate::lookup::{self, LookupServices};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::protocol::command::Command;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::tls::{self, MaybeTlsStream};
use crate::topic_stats::TopicStatsRegistry;

use state::ConnectionState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a connection task needs, shared across every connection on a
/// worker (spec §4.6, §4.7). Built once by `ProxyService` and cloned (cheap,
/// `Arc` fields throughout) into each spawned task.
#[derive(Clone)]
pub struct ConnectionServices {
    pub config: Arc<ProxyConfig>,
    pub admission: ConnectionController,
    pub authenticator: Arc<dyn Authenticator>,
    pub authorizer: Arc<dyn Authorizer>,
    pub discovery: Arc<dyn BrokerDiscovery>,
    pub dns: Arc<DnsResolver>,
    pub egress: Arc<BrokerProxyValidator>,
    pub topic_stats: TopicStatsRegistry,
    pub lookup_semaphore: Arc<Semaphore>,
    pub backend_tls: Option<tokio_rustls::TlsConnector>,
    pub shutdown: ShutdownSubscription,
}

/// spec §3 `ProxyConnection`.
pub struct ProxyConnection {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub state: ConnectionState,
    pub principal: Option<Principal>,
    pub protocol_version: u32,
    pub auth_method_name: Option<String>,
    pub selected_broker: Option<BrokerTarget>,
    pub inbound_bytes: u64,
    pub inbound_ops: u64,
}

impl ProxyConnection {
    fn new(remote_addr: SocketAddr) -> Self {
        ProxyConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            state: ConnectionState::Init,
            principal: None,
            protocol_version: 0,
            auth_method_name: None,
            selected_broker: None,
            inbound_bytes: 0,
            inbound_ops: 0,
        }
    }
}

/// Accepts a socket already admitted by the connection controller (spec
/// §4.1 step 2 onward) and drives it to completion. `permit` is held for
/// the lifetime of the connection so its `Drop` decrements the admission
/// counters exactly once, regardless of which exit path is taken.
pub async fn handle_connection(
    socket: MaybeTlsStream,
    remote_addr: SocketAddr,
    services: ConnectionServices,
    _permit: AdmissionPermit,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let mut conn = ProxyConnection::new(remote_addr);
    let conn_id = conn.id;

    if let Err(err) = drive_connection(&mut conn, socket, &services).await {
        tracing::warn!(connection_id = conn_id, remote = %remote_addr, error = %err, "connection closed with error");
    }

    conn.state = ConnectionState::Closed;
}

async fn drive_connection(
    conn: &mut ProxyConnection,
    socket: MaybeTlsStream,
    services: &ConnectionServices,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, FrameCodec::new());
    conn.state = ConnectionState::Connecting;

    // Init -> Connecting -> Connected: consume Connect, run the optional
    // auth challenge/response loop, then reply Connected (spec §4.3).
    if !authenticate_connection(conn, &mut framed, services).await? {
        return Ok(());
    }
    conn.state = ConnectionState::Connected;

    // Connected -> ProxyLookupRequests / ProxyConnectingToBroker: loop
    // reading frames, dispatching control-plane traffic to the lookup
    // handler until the first data-plane command arrives.
    let mut shutdown = services.shutdown.clone();
    loop {
        let frame = tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()), // peer closed cleanly
            },
            _ = shutdown.shutting_down() => {
                // spec §4.7: shutdown closes every live ProxyConnection
                // still in the lookup phase; splice-mode connections are
                // drained instead (see `run_splice`).
                return Ok(());
            }
        };
        conn.inbound_ops += 1;
        metrics::record_op();

        if conn.state == ConnectionState::Connected {
            conn.state = ConnectionState::ProxyLookupRequests;
        }

        if frame.command.is_lookup_family() {
            let principal = conn
                .principal
                .clone()
                .unwrap_or_else(|| Principal("anonymous".to_string()));
            let lookup_services = LookupServices {
                semaphore: services.lookup_semaphore.clone(),
                discovery: services.discovery.clone(),
                authorizer: services.authorizer.clone(),
                require_authorization: services.config.require_authorization,
                advertised_service_url: services.config.advertised_service_url(),
                lookup_request_timeout: services.config.lookup_request_timeout,
            };
            let (reply, target) =
                lookup::handle_lookup_family(&lookup_services, &principal, frame.command).await;
            if let Some(target) = target {
                conn.selected_broker = Some(target);
            }
            framed.send(Frame::new(reply)).await?;
            continue;
        }

        match &frame.command {
            Command::Ping => {
                framed.send(Frame::new(Command::Pong)).await?;
                continue;
            }
            Command::CloseConsumer { .. } | Command::CloseProducer { .. } => {
                framed.send(Frame::new(Command::Error {
                    request_id: frame.command.request_id(),
                    kind: ErrorKind::ProtocolError,
                    message: "close commands are not serviced by the proxy directly".to_string(),
                }))
                .await?;
                continue;
            }
            Command::Connect { .. } => {
                framed.send(Frame::new(Command::Error {
                    request_id: None,
                    kind: ErrorKind::ProtocolError,
                    message: "unexpected Connect after handshake".to_string(),
                }))
                .await?;
                return Ok(());
            }
            _ => {
                // First data-plane command: ProxyLookupRequests ->
                // ProxyConnectingToBroker (spec §4.3).
                return connect_to_broker_and_splice(conn, framed, frame, services).await;
            }
        }
    }
}

/// Drives `Init -> Connecting -> Connected`: reads the client's `Connect`,
/// pins the protocol version, and, if authentication is required, loops
/// `AuthChallenge`/`AuthResponse` until `Authenticator` reports success or
/// failure. Returns `Ok(true)` once `Connected` has been written, `Ok(false)`
/// if the connection ended (closed/rejected) before that point.
async fn authenticate_connection(
    conn: &mut ProxyConnection,
    framed: &mut Framed<MaybeTlsStream, FrameCodec>,
    services: &ConnectionServices,
) -> anyhow::Result<bool> {
    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => return Err(err.into()),
        None => return Ok(false),
    };

    let (protocol_version, mut auth_method_name, mut auth_data) = match frame.command {
        Command::Connect {
            protocol_version,
            auth_method_name,
            auth_data,
            ..
        } => (protocol_version, auth_method_name, auth_data),
        _ => {
            // spec §4.3: any command other than Connect while in Init is a
            // protocol error.
            framed
                .send(Frame::new(Command::Error {
                    request_id: None,
                    kind: ErrorKind::ProtocolError,
                    message: "expected Connect as first frame".to_string(),
                }))
                .await?;
            return Ok(false);
        }
    };
    conn.protocol_version = protocol_version;

    loop {
        let method = auth_method_name.clone().unwrap_or_default();
        let data = auth_data.clone().unwrap_or_default();

        match services.authenticator.authenticate(&method, &data).await {
            Ok(AuthOutcome::Authenticated(principal)) => {
                conn.principal = Some(principal);
                conn.auth_method_name = auth_method_name;
                break;
            }
            Ok(AuthOutcome::Challenge(challenge)) => {
                framed
                    .send(Frame::new(Command::AuthChallenge {
                        auth_method_name: challenge.auth_method_name,
                        auth_data: challenge.auth_data,
                    }))
                    .await?;
                let response = match framed.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(false),
                };
                match response.command {
                    Command::AuthResponse {
                        auth_method_name: m,
                        auth_data: d,
                    } => {
                        auth_method_name = Some(m);
                        auth_data = Some(d);
                    }
                    _ => {
                        framed
                            .send(Frame::new(Command::Error {
                                request_id: None,
                                kind: ErrorKind::ProtocolError,
                                message: "expected AuthResponse".to_string(),
                            }))
                            .await?;
                        return Ok(false);
                    }
                }
            }
            Err(_) => {
                framed
                    .send(Frame::new(Command::Error {
                        request_id: None,
                        kind: ErrorKind::AuthenticationError,
                        message: "authentication failed".to_string(),
                    }))
                    .await?;
                return Ok(false);
            }
        }
    }

    framed
        .send(Frame::new(Command::Connected {
            protocol_version,
            max_message_size: None,
        }))
        .await?;
    Ok(true)
}

/// `ProxyLookupRequests -> ProxyConnectingToBroker -> ProxyConnectionToEndpoint`
/// (spec §4.3, §4.5): resolves the broker target for the triggering
/// data-plane command, validates egress, opens the backend socket while
/// buffering further inbound frames, then hands both sockets to the splice
/// path.
async fn connect_to_broker_and_splice(
    conn: &mut ProxyConnection,
    mut framed: Framed<MaybeTlsStream, FrameCodec>,
    triggering_frame: Frame,
    services: &ConnectionServices,
) -> anyhow::Result<()> {
    let target = match conn.selected_broker.clone() {
        Some(target) => target,
        None => match services.discovery.least_loaded_broker().await {
            Ok(target) => target,
            Err(err) => {
                // spec §4.3: egress/resolution failure on the triggering
                // command returns the connection to ProxyLookupRequests
                // rather than closing it.
                framed
                    .send(Frame::new(Command::Error {
                        request_id: triggering_frame.command.request_id(),
                        kind: ErrorKind::ServiceNotReady,
                        message: err.to_string(),
                    }))
                    .await?;
                conn.state = ConnectionState::ProxyLookupRequests;
                return continue_lookup_loop(conn, framed, services).await;
            }
        },
    };

    // TLS to the backend is only attempted when the resolved target itself
    // advertises a TLS URL *and* a backend connector is available (spec
    // §4.5: "TLS to the backend is performed if configured") — a connector
    // being configured doesn't mean every broker speaks TLS.
    let prefer_tls = target.service_url_tls.is_some() && services.backend_tls.is_some();
    let (host, port) = match target.host_port(prefer_tls) {
        Ok(hp) => hp,
        Err(err) => {
            framed
                .send(Frame::new(Command::Error {
                    request_id: triggering_frame.command.request_id(),
                    kind: ErrorKind::MetadataError,
                    message: err.to_string(),
                }))
                .await?;
            conn.state = ConnectionState::ProxyLookupRequests;
            return continue_lookup_loop(conn, framed, services).await;
        }
    };

    if let Err(err) = services.egress.validate(&services.dns, &host, port).await {
        framed
            .send(Frame::new(Command::Error {
                request_id: triggering_frame.command.request_id(),
                kind: err.kind(),
                message: err.to_string(),
            }))
            .await?;
        conn.state = ConnectionState::ProxyLookupRequests;
        return continue_lookup_loop(conn, framed, services).await;
    }

    conn.state = ConnectionState::ProxyConnectingToBroker {
        target: target.clone(),
    };

    let handler = DirectProxyHandler::new(
        services.config.pending_queue_capacity,
        direct_proxy::default_pending_frame_rate(),
    );

    let mut pending: VecDeque<Frame> = VecDeque::new();
    pending.push_back(triggering_frame);

    let addr = format!("{host}:{port}");
    let connect_fut = tls::connect_backend(&addr, &host, prefer_tls, services.backend_tls.as_ref());
    tokio::pin!(connect_fut);

    let backend = loop {
        let next_frame = framed.next();
        tokio::pin!(next_frame);
        match futures_util::future::select(connect_fut.as_mut(), next_frame).await {
            Either::Left((connect_result, _)) => {
                break connect_result.map_err(|e| anyhow::anyhow!(e))?;
            }
            Either::Right((Some(Ok(frame)), _)) => {
                if !handler.admit_pending_frame() || pending.len() >= handler.pending_capacity {
                    reject_pending_overflow(&mut framed, &pending).await?;
                    return Ok(());
                }
                pending.push_back(frame);
            }
            Either::Right((Some(Err(err)), _)) => return Err(err.into()),
            Either::Right((None, _)) => return Ok(()),
        }
    };

    conn.state = ConnectionState::ProxyConnectionToEndpoint;

    let mut backend_framed = Framed::new(backend, FrameCodec::new());
    for frame in pending.drain(..) {
        if let Err(err) = backend_framed.send(frame).await {
            tracing::warn!(connection_id = conn.id, error = %err, "failed flushing pending frame to backend");
            return Err(err.into());
        }
    }

    let client_socket = framed.into_inner();
    let backend_socket = backend_framed.into_inner();

    let splice_cfg = SpliceConfig {
        zero_copy_enabled: services.config.proxy_zero_copy_mode_enabled,
    };
    let result = direct_proxy::run_splice(client_socket, backend_socket, splice_cfg).await;
    match result {
        Ok(r) => {
            services
                .topic_stats
                .record(&target.service_url, r.client_to_broker_bytes + r.broker_to_client_bytes, 1);
            metrics::record_topic_bytes(
                &target.service_url,
                r.client_to_broker_bytes + r.broker_to_client_bytes,
                1,
            );
            conn.inbound_bytes += r.client_to_broker_bytes;
        }
        Err(err) => {
            tracing::warn!(connection_id = conn.id, error = %err, "splice pump ended with error");
        }
    }
    conn.state = ConnectionState::Closing;
    Ok(())
}

async fn continue_lookup_loop(
    conn: &mut ProxyConnection,
    mut framed: Framed<MaybeTlsStream, FrameCodec>,
    services: &ConnectionServices,
) -> anyhow::Result<()> {
    loop {
        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(()),
        };
        conn.inbound_ops += 1;
        metrics::record_op();

        if frame.command.is_lookup_family() {
            let principal = conn
                .principal
                .clone()
                .unwrap_or_else(|| Principal("anonymous".to_string()));
            let lookup_services = LookupServices {
                semaphore: services.lookup_semaphore.clone(),
                discovery: services.discovery.clone(),
                authorizer: services.authorizer.clone(),
                require_authorization: services.config.require_authorization,
                advertised_service_url: services.config.advertised_service_url(),
                lookup_request_timeout: services.config.lookup_request_timeout,
            };
            let (reply, target) =
                lookup::handle_lookup_family(&lookup_services, &principal, frame.command).await;
            if let Some(target) = target {
                conn.selected_broker = Some(target);
            }
            framed.send(Frame::new(reply)).await?;
            continue;
        }

        match &frame.command {
            Command::Ping => {
                framed.send(Frame::new(Command::Pong)).await?;
            }
            _ => return connect_to_broker_and_splice(conn, framed, frame, services).await,
        }
    }
}

/// spec §4.3: "if the backend socket fails before Connected, all buffered
/// pending frames are dropped; each Send/lookup among them is replied with
/// an error ... if one was parseable, otherwise the client connection is
/// closed" — approximated here as "pending overflow closes the connection
/// with TooManyRequests" per §4.5's explicit overflow rule, replying first
/// to whichever buffered frames carry a request_id.
async fn reject_pending_overflow(
    framed: &mut Framed<MaybeTlsStream, FrameCodec>,
    pending: &VecDeque<Frame>,
) -> anyhow::Result<()> {
    for frame in pending {
        if let Some(request_id) = frame.command.request_id() {
            let _ = framed
                .send(Frame::new(Command::Error {
                    request_id: Some(request_id),
                    kind: ErrorKind::TooManyRequests,
                    message: "pending frame queue overflowed while connecting to backend".to_string(),
                }))
                .await;
        }
    }
    Ok(())
}

