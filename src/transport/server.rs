//! WebSocket listener for inbound peers.
//!
//! # Connection Flow
//!
//! 1. [`WsListener::bind`] binds to `ip:port` (port 0 picks a free port)
//! 2. Peers dial [`WsListener::ws_url`]
//! 3. [`WsListener::accept`] upgrades each TCP stream to a [`WsTransport`]
//! 4. The caller wraps it in a [`Connection`](crate::Connection) and registers it

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::WsTransport;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for a peer to finish the WebSocket upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// WsListener
// ============================================================================

/// A bound WebSocket server socket.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use ws_connpool::transport::WsListener;
///
/// let listener = WsListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// println!("listening on {}", listener.ws_url());
///
/// loop {
///     let (transport, addr) = listener.accept().await?;
///     // wrap and register ...
/// }
/// ```
pub struct WsListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
}

impl WsListener {
    /// Binds a WebSocket server to the specified address and port.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this listener.
    ///
    /// Format: `ws://{ip}:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Waits for the next peer and completes the WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if accepting the TCP stream fails
    /// - [`Error::Transport`] if the upgrade times out
    /// - [`Error::WebSocket`] if the upgrade handshake fails
    pub async fn accept(&self) -> Result<(WsTransport<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(?addr, "TCP connection accepted");

        let transport = timeout(HANDSHAKE_TIMEOUT, WsTransport::accept(stream))
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "WebSocket upgrade from {addr} timed out after {}ms",
                    HANDSHAKE_TIMEOUT.as_millis()
                ))
            })??;

        info!(?addr, "WebSocket connection established");

        Ok((transport, addr))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio_test::assert_ok;

    use crate::transport::Transport;

    async fn bind_localhost() -> WsListener {
        WsListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed")
    }

    async fn connected_pair(listener: &WsListener) -> (WsTransport, WsTransport<TcpStream>) {
        let url = listener.ws_url();
        let (client, server) = tokio::join!(WsTransport::connect(&url), listener.accept());
        let client = client.expect("client connects");
        let (server, _addr) = server.expect("server accepts");
        (client, server)
    }

    #[tokio::test]
    async fn test_listener_bind_random_port() {
        let listener = bind_localhost().await;
        assert!(listener.port() > 0);
        assert!(listener.ws_url().starts_with("ws://127.0.0.1:"));
    }

    #[tokio::test]
    async fn test_listener_ws_url_format() {
        let listener = bind_localhost().await;
        let expected = format!("ws://127.0.0.1:{}", listener.port());
        assert_eq!(listener.ws_url(), expected);
        assert_eq!(listener.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_text_and_binary_frames_round_trip() {
        let listener = bind_localhost().await;
        let (client, server) = connected_pair(&listener).await;

        assert_ok!(client.send(b"hello").await);
        assert_eq!(assert_ok!(server.receive().await), b"hello");

        assert_ok!(server.send(&[0xff, 0x00, 0x01]).await);
        assert_eq!(assert_ok!(client.receive().await), vec![0xff, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_close_frame_reaches_close_handler() {
        let listener = bind_localhost().await;
        let (client, server) = connected_pair(&listener).await;

        let codes = Arc::new(Mutex::new(Vec::new()));
        {
            let codes = Arc::clone(&codes);
            server.set_close_handler(Arc::new(move |code: u16, _reason: &str| {
                codes.lock().push(code);
                Ok(())
            }));
        }

        assert_ok!(client.close().await);
        let result = server.receive().await;

        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(codes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_close_releases_both_halves_without_peer_reply() {
        let listener = bind_localhost().await;
        let (client, server) = connected_pair(&listener).await;
        let server = Arc::new(server);

        let reader = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.receive().await })
        };
        tokio::task::yield_now().await;

        // the client never reads, so it never answers the close frame
        let closed = timeout(Duration::from_secs(2), server.close()).await;
        assert_ok!(assert_ok!(closed));

        let pending = timeout(Duration::from_secs(2), reader)
            .await
            .expect("pending read woken")
            .expect("reader task");
        assert!(matches!(pending, Err(Error::ConnectionClosed)));

        assert!(matches!(server.receive().await, Err(Error::ConnectionClosed)));
        assert!(matches!(server.send(b"late").await, Err(Error::ConnectionClosed)));
        assert_ok!(server.close().await);

        assert!(client.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_read_deadline_on_websocket() {
        let listener = bind_localhost().await;
        let (_client, server) = connected_pair(&listener).await;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
        assert_ok!(server.set_read_deadline(deadline));
        assert!(matches!(server.receive().await, Err(Error::DeadlineExceeded)));
    }
}
