//! Shared plumbing for the integration tests: picking a free local port and
//! standing up small in-process stand-ins for a broker (spec §1's external
//! collaborator), so each scenario test doesn't have to reimplement them.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Binds an ephemeral port, reads it back, and releases it immediately so a
/// `ProxyConfig` can be built with a concrete `service_port` before the
/// service itself binds. Carries the usual TOCTOU caveat of this pattern,
/// acceptable for a test running on loopback.
pub async fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind port probe");
    let port = probe.local_addr().expect("local_addr").port();
    drop(probe);
    port
}

/// Connects to `127.0.0.1:port`, retrying briefly while the listener is
/// still coming up.
pub async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on 127.0.0.1:{port} after 1s");
}

/// A backend stand-in that accepts a single connection and echoes whatever
/// raw bytes it receives straight back, for exercising the splice path
/// without needing a real broker.
pub async fn spawn_echo_broker() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind echo broker");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let (mut rd, mut wr) = socket.into_split();
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        }
    });
    port
}
