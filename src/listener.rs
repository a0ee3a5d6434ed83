//! Listener and admission layer (spec §4.1). Binds a plaintext and/or TLS
//! port, admits or rejects each accepted socket via the connection
//! controller, and spawns `connection::handle_connection` for every
//! admitted one.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::connection::{self, ConnectionServices};
use crate::lifecycle::{Activity, ShutdownSubscription};
use crate::metrics;
use crate::tls::MaybeTlsStream;

/// Runs the accept loop for one bound address until shutdown is requested.
/// `acceptor` is `Some` for the TLS port, `None` for the plaintext one.
/// `root_activity` is cloned for each accepted connection so the drain at
/// shutdown waits for it (spec §4.7).
pub async fn run(
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    services: ConnectionServices,
    root_activity: Activity,
    mut shutdown: ShutdownSubscription,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;
    tracing::info!(%addr, tls = acceptor.is_some(), "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%addr, error = %err, "accept failed");
                        continue;
                    }
                };
                accept_one(socket, remote_addr, acceptor.clone(), services.clone(), root_activity.clone());
            }
            _ = shutdown.shutting_down() => {
                tracing::info!(%addr, "listener stopping accept loop");
                return Ok(());
            }
        }
    }
}

fn accept_one(
    socket: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    services: ConnectionServices,
    activity: Activity,
) {
    // spec §4.1 step 1: admission is checked before anything else is done
    // with the socket; a rejected connection is closed with no response.
    let permit = match services.admission.try_admit(remote_addr.ip()) {
        Ok(permit) => permit,
        Err(err) => {
            tracing::debug!(%remote_addr, error = %err, "connection rejected by admission controller");
            metrics::record_rejected_connection();
            drop(socket);
            return;
        }
    };

    tokio::spawn(async move {
        let _activity = activity;
        let maybe_tls = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls_stream) => MaybeTlsStream::tls(tls_stream),
                Err(err) => {
                    tracing::debug!(%remote_addr, error = %err, "TLS handshake failed");
                    return;
                }
            },
            None => MaybeTlsStream::plain(socket),
        };

        connection::handle_connection(maybe_tls, remote_addr, services, permit).await;
    });
}
