//! TLS termination (listener side) and TLS origination (backend side),
//! spec §4.1 ("TLS ... terminates at this layer") and §4.5 ("TLS to the
//! backend is performed if configured"). Builds `rustls` configs from the
//! `TlsConfig` section and wraps both directions in a small enum so the
//! rest of the proxy core can treat a plain and a TLS-wrapped socket
//! identically wherever only `AsyncRead`/`AsyncWrite` is needed.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;
use crate::direct_proxy::IntoPlainTcp;

fn load_certs(path: &std::path::Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let raw = std::fs::read(path).map_err(|e| anyhow::anyhow!("reading {path:?}: {e}"))?;
    let certs = rustls_pemfile::certs(&mut raw.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("parsing certificate {path:?}: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path:?}");
    }
    Ok(certs)
}

fn load_private_key(path: &std::path::Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let raw = std::fs::read(path).map_err(|e| anyhow::anyhow!("reading {path:?}: {e}"))?;
    rustls_pemfile::private_key(&mut raw.as_slice())
        .map_err(|e| anyhow::anyhow!("parsing private key {path:?}: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {path:?}"))
}

/// Builds the listener-side TLS acceptor. Fatal (spec §7: "missing required
/// TLS material" aborts startup) if the TLS port is configured but the
/// certificate/key are missing or unreadable.
pub fn build_acceptor(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let cert_path = tls
        .certificate
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("servicePortTls is set but no certificate was configured"))?;
    let key_path = tls
        .private_key
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("servicePortTls is set but no private key was configured"))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("building TLS server config: {e}"))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Builds the client-side TLS connector used to reach brokers over TLS. A
/// configured trust store is preferred; otherwise falls back to the
/// well-known web PKI roots, which is sufficient for brokers that present a
/// publicly-issued certificate.
pub fn build_connector(tls: &TlsConfig) -> anyhow::Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(trust_store) = &tls.trust_store {
        for cert in load_certs(trust_store)? {
            roots.add(cert)?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !tls.verify_hostname {
        client_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoHostnameVerification(
                rustls::crypto::CryptoProvider::get_default()
                    .expect("default crypto provider installed")
                    .clone(),
            )));
    }

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Skips certificate verification entirely when `verify_hostname = false`
/// is set. rustls 0.23 has no supported way to validate a chain while
/// skipping only the hostname check, so this option is all-or-nothing;
/// it exists for internal clusters with self-signed, SAN-less certificates
/// and should not be set for anything exposed beyond a trusted network.
#[derive(Debug)]
struct NoHostnameVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoHostnameVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pin_project! {
    /// The listener-facing socket: either a bare `TcpStream` (plaintext
    /// port) or a `tokio-rustls` server stream (TLS port). The connection
    /// state machine (`connection::drive_connection`) is written against
    /// `AsyncRead + AsyncWrite` and never needs to know which.
    #[project = MaybeTlsStreamProj]
    pub enum MaybeTlsStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: Box<tokio_rustls::server::TlsStream<TcpStream>> },
    }
}

impl MaybeTlsStream {
    pub fn plain(stream: TcpStream) -> Self {
        MaybeTlsStream::Plain { inner: stream }
    }

    pub fn tls(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        MaybeTlsStream::Tls {
            inner: Box::new(stream),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { inner } => inner.poll_read(cx, buf),
            MaybeTlsStreamProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { inner } => inner.poll_write(cx, buf),
            MaybeTlsStreamProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { inner } => inner.poll_flush(cx),
            MaybeTlsStreamProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { inner } => inner.poll_shutdown(cx),
            MaybeTlsStreamProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}

impl IntoPlainTcp for MaybeTlsStream {
    fn into_plain_tcp(self) -> Result<TcpStream, Self> {
        match self {
            MaybeTlsStream::Plain { inner } => Ok(inner),
            other => Err(other),
        }
    }
}

pin_project! {
    /// The backend-facing socket, mirroring `MaybeTlsStream` for the
    /// outbound direction (spec §4.5: "TLS to the backend is performed if
    /// configured").
    #[project = MaybeTlsClientStreamProj]
    pub enum MaybeTlsClientStream {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: Box<tokio_rustls::client::TlsStream<TcpStream>> },
    }
}

impl MaybeTlsClientStream {
    pub fn plain(stream: TcpStream) -> Self {
        MaybeTlsClientStream::Plain { inner: stream }
    }

    pub fn tls(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        MaybeTlsClientStream::Tls {
            inner: Box::new(stream),
        }
    }
}

impl AsyncRead for MaybeTlsClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsClientStreamProj::Plain { inner } => inner.poll_read(cx, buf),
            MaybeTlsClientStreamProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsClientStreamProj::Plain { inner } => inner.poll_write(cx, buf),
            MaybeTlsClientStreamProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsClientStreamProj::Plain { inner } => inner.poll_flush(cx),
            MaybeTlsClientStreamProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsClientStreamProj::Plain { inner } => inner.poll_shutdown(cx),
            MaybeTlsClientStreamProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}

impl IntoPlainTcp for MaybeTlsClientStream {
    fn into_plain_tcp(self) -> Result<TcpStream, Self> {
        match self {
            MaybeTlsClientStream::Plain { inner } => Ok(inner),
            other => Err(other),
        }
    }
}

/// Connects to the backend, optionally wrapping with TLS when the lookup
/// resolved a `service_url_tls` and a client config is available.
pub async fn connect_backend(
    addr: &str,
    host: &str,
    tls_requested: bool,
    connector: Option<&TlsConnector>,
) -> io::Result<MaybeTlsClientStream> {
    let tcp = TcpStream::connect(addr).await?;
    match (tls_requested, connector) {
        (true, Some(connector)) => {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let tls_stream = connector.connect(server_name, tcp).await?;
            Ok(MaybeTlsClientStream::tls(tls_stream))
        }
        _ => Ok(MaybeTlsClientStream::plain(tcp)),
    }
}
