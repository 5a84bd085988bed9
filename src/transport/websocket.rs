//! WebSocket transport over tokio-tungstenite.
//!
//! The stream is split so a receive loop and concurrent senders never
//! contend for the same half. Writes are serialized by the sink's mutex.
//!
//! [`Transport::close`] sends a close frame, wakes any pending read, and
//! drops both halves, which releases the socket without waiting for the
//! peer's reply.
//!
//! # Framing
//!
//! | Direction | Mapping |
//! |-----------|---------|
//! | outbound | valid UTF-8 payload → text frame, otherwise binary frame |
//! | inbound | text and binary frames → payload bytes |
//! | inbound | ping/pong/raw frames → skipped |
//! | inbound | close frame → close handler, then [`Error::ConnectionClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

use super::{CloseHandler, ReadDeadline, Transport, default_close_handler, wait_until_set};

// ============================================================================
// Constants
// ============================================================================

/// Close code reported when the peer's close frame carries no status.
const NO_STATUS_CODE: u16 = 1005;

/// Upper bound for flushing the outbound close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// WsTransport
// ============================================================================

/// [`Transport`] backed by a WebSocket stream.
pub struct WsTransport<S = MaybeTlsStream<TcpStream>> {
    sink: AsyncMutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    stream: AsyncMutex<Option<SplitStream<WebSocketStream<S>>>>,
    close_handler: Mutex<CloseHandler>,
    deadline: ReadDeadline,
    closed: watch::Sender<bool>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    #[must_use]
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            sink: AsyncMutex::new(Some(sink)),
            stream: AsyncMutex::new(Some(stream)),
            close_handler: Mutex::new(default_close_handler()),
            deadline: ReadDeadline::new(),
            closed: watch::Sender::new(false),
        }
    }
}

impl WsTransport<MaybeTlsStream<TcpStream>> {
    /// Dials a WebSocket server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, response) = tokio_tungstenite::connect_async(url).await?;
        debug!(url, status = %response.status(), "WebSocket client connected");
        Ok(Self::new(ws_stream))
    }
}

impl WsTransport<TcpStream> {
    /// Upgrades an accepted TCP stream to a WebSocket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the upgrade handshake fails.
    pub async fn accept(stream: TcpStream) -> Result<Self> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        Ok(Self::new(ws_stream))
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::binary(payload.to_vec()),
        };

        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(Error::ConnectionClosed)?;
        sink.send(message).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        let stream = stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let closed = wait_until_set(self.closed.subscribe());
        tokio::pin!(closed);

        loop {
            let next = tokio::select! {
                biased;
                () = &mut closed => return Err(Error::ConnectionClosed),
                next = self.deadline.run(stream.next()) => next?,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((NO_STATUS_CODE, String::new()));

                    debug!(code, reason = %reason, "WebSocket closed by remote");

                    let handler = self.close_handler.lock().clone();
                    handler(code, &reason)?;
                    return Err(Error::ConnectionClosed);
                }
                // Ping, Pong and raw frames carry no payload for the caller
                Some(Ok(other)) => {
                    trace!(kind = ?other, "Skipping control frame");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(Error::ConnectionClosed),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let sink = self.sink.lock().await.take();
        let result = match sink {
            Some(mut sink) => match timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => {
                    warn!("Timed out flushing close frame");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        // pending reads have observed `closed` and released the lock
        drop(self.stream.lock().await.take());

        result
    }

    fn close_handler(&self) -> CloseHandler {
        self.close_handler.lock().clone()
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = handler;
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<()> {
        self.deadline.set(deadline);
        Ok(())
    }
}
