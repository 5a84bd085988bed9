//! In-process transport pair.
//!
//! [`MemoryTransport::pair`] returns the transport side, to be wrapped in a
//! [`Connection`](crate::Connection), and a [`MemoryPeer`] that plays the
//! remote end: it injects inbound frames and close frames, reads what the
//! connection sent, and can make writes fail.
//!
//! ```ignore
//! let (transport, peer) = MemoryTransport::pair();
//! let connection = Connection::new(Some(Arc::new(transport)), "c1")?;
//!
//! peer.send("hello")?;
//! connection.send(b"world").await?;
//! assert_eq!(peer.recv().await.as_deref(), Some(&b"world"[..]));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::Instant;
use tracing::trace;

use crate::error::{Error, Result};

use super::{CloseHandler, ReadDeadline, Transport, default_close_handler, wait_until_set};

// ============================================================================
// Types
// ============================================================================

/// Frame travelling from the peer to the transport.
enum Frame {
    Data(Vec<u8>),
    Close { code: u16, reason: String },
}

/// State visible to both ends.
struct Shared {
    closed: watch::Sender<bool>,
    close_calls: AtomicUsize,
    fail_writes: AtomicBool,
    deadline: ReadDeadline,
}

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport side of an in-process pair.
pub struct MemoryTransport {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close_handler: Mutex<CloseHandler>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Creates a connected transport and its peer.
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            closed: watch::Sender::new(false),
            close_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            deadline: ReadDeadline::new(),
        });

        let transport = Self {
            inbound: AsyncMutex::new(inbound_rx),
            outbound: outbound_tx,
            close_handler: Mutex::new(default_close_handler()),
            shared: Arc::clone(&shared),
        };

        let peer = MemoryPeer {
            inbound: inbound_tx,
            outbound: AsyncMutex::new(outbound_rx),
            shared,
        };

        (transport, peer)
    }

    fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::transport("write failed"));
        }

        self.outbound
            .send(payload.to_vec())
            .map_err(|_| Error::transport("peer dropped"))
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let closed = wait_until_set(self.shared.closed.subscribe());
        let mut inbound = self.inbound.lock().await;

        let frame = tokio::select! {
            biased;
            frame = self.shared.deadline.run(inbound.recv()) => frame?,
            () = closed => return Err(Error::ConnectionClosed),
        };

        match frame {
            Some(Frame::Data(payload)) => Ok(payload),
            Some(Frame::Close { code, reason }) => {
                let handler = self.close_handler.lock().clone();
                trace!(code, reason = %reason, "Close frame received");
                handler(code, &reason)?;
                Err(Error::ConnectionClosed)
            }
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.shared.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.closed.send_replace(true);
        Ok(())
    }

    fn close_handler(&self) -> CloseHandler {
        self.close_handler.lock().clone()
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = handler;
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<()> {
        self.shared.deadline.set(deadline);
        Ok(())
    }
}

// ============================================================================
// MemoryPeer
// ============================================================================

/// Remote end of a [`MemoryTransport`].
///
/// Dropping the peer ends the stream: the next read fails with
/// [`Error::ConnectionClosed`].
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Frame>,
    outbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Delivers a data frame to the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the transport was dropped.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.inbound
            .send(Frame::Data(payload.into()))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Delivers a close frame to the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the transport was dropped.
    pub fn send_close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.inbound
            .send(Frame::Close {
                code,
                reason: reason.into(),
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Waits for the next frame the transport sent.
    ///
    /// Returns `None` once the transport is dropped and drained.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.outbound.lock().await.recv().await
    }

    /// Returns the next sent frame if one is already buffered.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.outbound.try_lock().ok()?.try_recv().ok()
    }

    /// Makes subsequent transport writes fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns `true` once the transport has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Number of times [`Transport::close`] was called.
    #[inline]
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.shared.close_calls.load(Ordering::SeqCst)
    }

    /// Current read deadline of the transport.
    #[inline]
    #[must_use]
    pub fn read_deadline(&self) -> Option<Instant> {
        self.shared.deadline.get()
    }

    /// Waits until the transport is closed.
    pub async fn closed(&self) {
        wait_until_set(self.shared.closed.subscribe()).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, peer) = MemoryTransport::pair();

        assert_ok!(peer.send("ping"));
        assert_eq!(assert_ok!(transport.receive().await), b"ping");

        assert_ok!(transport.send(b"pong").await);
        assert_eq!(peer.recv().await, Some(b"pong".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline_expires() {
        let (transport, _peer) = MemoryTransport::pair();
        assert_ok!(transport.set_read_deadline(Instant::now() + Duration::from_secs(3)));

        let result = transport.receive().await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_read_observes_new_deadline() {
        let (transport, peer) = MemoryTransport::pair();
        let transport = Arc::new(transport);
        let start = Instant::now();
        assert_ok!(transport.set_read_deadline(start + Duration::from_secs(2)));

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_ok!(transport.set_read_deadline(start + Duration::from_secs(10)));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_ok!(peer.send("late"));

        let frame = reader.await.expect("reader task");
        assert_eq!(assert_ok!(frame), b"late");
    }

    #[tokio::test]
    async fn test_close_frame_runs_handler() {
        let (transport, peer) = MemoryTransport::pair();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            transport.set_close_handler(Arc::new(move |code: u16, reason: &str| {
                *seen.lock() = Some((code, reason.to_string()));
                Ok(())
            }));
        }

        assert_ok!(peer.send_close(1000, "bye"));
        assert!(matches!(
            transport.receive().await,
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(*seen.lock(), Some((1000, "bye".to_string())));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_reader() {
        let (transport, peer) = MemoryTransport::pair();
        let transport = Arc::new(transport);

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive().await })
        };

        tokio::task::yield_now().await;
        assert_ok!(transport.close().await);

        let result = reader.await.expect("reader task");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
        assert_err!(transport.send(b"after close").await);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let (transport, peer) = MemoryTransport::pair();
        peer.fail_writes(true);
        assert!(matches!(
            transport.send(b"x").await,
            Err(Error::Transport { .. })
        ));

        peer.fail_writes(false);
        assert_ok!(transport.send(b"y").await);
        assert_eq!(peer.try_recv(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (transport, peer) = MemoryTransport::pair();
        drop(peer);
        assert!(matches!(
            transport.receive().await,
            Err(Error::ConnectionClosed)
        ));
    }
}
