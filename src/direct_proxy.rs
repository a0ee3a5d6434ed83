//! Splice-mode forwarding (spec §3 `DirectProxyHandler`, §4.5). Once a
//! `ProxyConnection` reaches `ProxyConnectionToEndpoint`, the client-facing
//! decoder is retired and the two sockets are pumped byte-for-byte in both
//! directions until either side closes.
//!
//! Zero-copy `splice(2)` is used when both sides are plain TCP and the OS
//! is Linux (`splice`); everything else — TLS on either leg, or a non-Linux
//! host — falls back to the adaptive-buffer copy in `splice` module. The
//! dispatch is resolved once per connection via `IntoPlainTcp`, grounded on
//! the same "is this a raw fd" check `proxy-server`'s splice path makes
//! before choosing its fast path.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::splice::adaptive_copy;

/// Distinguishes a bare `TcpStream` from a TLS-wrapped stream so the splice
/// dispatcher can pick the zero-copy path only when it's actually available.
pub trait IntoPlainTcp: Sized {
    fn into_plain_tcp(self) -> Result<TcpStream, Self>;
}

impl IntoPlainTcp for TcpStream {
    fn into_plain_tcp(self) -> Result<TcpStream, Self> {
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpliceConfig {
    pub zero_copy_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceResult {
    pub client_to_broker_bytes: u64,
    pub broker_to_client_bytes: u64,
}

/// Runs the bidirectional pump to completion. Returns once both directions
/// have seen EOF (or one side has errored, in which case the other side's
/// pump is abandoned — spec §7: "backend socket reset mid-splice: close the
/// client socket").
pub async fn run_splice<C, B>(client: C, broker: B, splice_cfg: SpliceConfig) -> io::Result<SpliceResult>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static + IntoPlainTcp,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static + IntoPlainTcp,
{
    match (client.into_plain_tcp(), broker.into_plain_tcp()) {
        #[cfg(target_os = "linux")]
        (Ok(c), Ok(b)) if splice_cfg.zero_copy_enabled => run_linux_splice(c, b).await,
        (Ok(c), Ok(b)) => run_adaptive(c, b).await,
        (Ok(c), Err(b)) => run_adaptive(c, b).await,
        (Err(c), Ok(b)) => run_adaptive(c, b).await,
        (Err(c), Err(b)) => run_adaptive(c, b).await,
    }
}

async fn run_adaptive<C, B>(client: C, broker: B) -> io::Result<SpliceResult>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut cr, mut cw) = tokio::io::split(client);
    let (mut br, mut bw) = tokio::io::split(broker);

    let c2b = async {
        let n = adaptive_copy(&mut cr, &mut bw).await?;
        let _ = bw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };
    let b2c = async {
        let n = adaptive_copy(&mut br, &mut cw).await?;
        let _ = cw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };

    let (client_to_broker_bytes, broker_to_client_bytes) = tokio::try_join!(c2b, b2c)?;
    Ok(SpliceResult {
        client_to_broker_bytes,
        broker_to_client_bytes,
    })
}

#[cfg(target_os = "linux")]
async fn run_linux_splice(mut client: TcpStream, mut broker: TcpStream) -> io::Result<SpliceResult> {
    let (mut cr, mut cw) = client.split();
    let (mut br, mut bw) = broker.split();

    let c2b = async {
        let n = crate::splice::splice_copy(&mut cr, &mut bw).await?;
        let _ = bw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };
    let b2c = async {
        let n = crate::splice::splice_copy(&mut br, &mut cw).await?;
        let _ = cw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };

    let (client_to_broker_bytes, broker_to_client_bytes) = tokio::try_join!(c2b, b2c)?;
    Ok(SpliceResult {
        client_to_broker_bytes,
        broker_to_client_bytes,
    })
}

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Per-connection bookkeeping for the splice path (spec §3
/// `DirectProxyHandler`): the inbound request-rate sampler that throttles a
/// client that's still sending frames while the backend handshake is in
/// flight, and the bound on how many of those frames may be queued before
/// the connection is dropped with `TooManyRequests`.
///
/// The backpressure high/low water marks in `ProxyConfig` describe a
/// buffered-writer model; this implementation's pump only ever reads one
/// chunk ahead of the write it's paired with (see `run_adaptive`/
/// `run_linux_splice`), so bounded memory use falls out of that synchronous
/// read-then-write structure without needing separate watermark tracking.
/// The knobs are kept in config for a future buffered-writer pump.
pub struct DirectProxyHandler {
    rate_limiter: Arc<Limiter>,
    pub pending_capacity: usize,
}

impl DirectProxyHandler {
    pub fn new(pending_capacity: usize, max_inbound_frames_per_sec: u32) -> Self {
        let quota = match std::num::NonZeroU32::new(max_inbound_frames_per_sec) {
            Some(n) => Quota::per_second(n),
            None => Quota::per_second(nonzero!(1u32)),
        };
        DirectProxyHandler {
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            pending_capacity,
        }
    }

    /// Samples the inbound rate of frames arriving while the backend
    /// connection is still being established. Returns `false` once the
    /// configured rate is exceeded, signalling the caller to close the
    /// connection with `TooManyRequests` rather than buffer indefinitely.
    pub fn admit_pending_frame(&self) -> bool {
        self.rate_limiter.check().is_ok()
    }
}

pub fn default_pending_frame_rate() -> u32 {
    1000
}

pub const fn default_rollup_period() -> Duration {
    Duration::from_secs(60)
}
