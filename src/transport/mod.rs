//! Message-oriented transports wrapped by [`Connection`](crate::Connection).
//!
//! A transport carries opaque byte frames. The connection layer only needs
//! the capability set of [`Transport`]: send, blocking receive, read
//! deadline, close, and a native close handler.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | [`WsTransport`] over tokio-tungstenite |
//! | `server` | [`WsListener`] accepting WebSocket peers |
//! | `memory` | [`MemoryTransport`] in-process pair for tests and benches |

// ============================================================================
// Submodules
// ============================================================================

/// In-process transport pair.
pub mod memory;

/// WebSocket listener for inbound peers.
pub mod server;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use std::future::{Future, pending};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Handler run when the peer sends a close frame.
///
/// Receives the close code and reason.
pub type CloseHandler = Arc<dyn Fn(u16, &str) -> Result<()> + Send + Sync>;

/// Close handler that accepts every close frame without side effects.
#[must_use]
pub fn default_close_handler() -> CloseHandler {
    Arc::new(|_code: u16, _reason: &str| Ok(()))
}

// ============================================================================
// Transport
// ============================================================================

/// Capability set of a persistent, message-framed connection.
///
/// Methods take `&self` so one task can block in [`receive`](Self::receive)
/// while others [`send`](Self::send).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one frame.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next data frame.
    ///
    /// # Errors
    ///
    /// - [`Error::DeadlineExceeded`](crate::Error::DeadlineExceeded) once the read deadline passes
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the peer closed
    async fn receive(&self) -> Result<Vec<u8>>;

    /// Releases the underlying resource.
    async fn close(&self) -> Result<()>;

    /// Returns the current close handler.
    fn close_handler(&self) -> CloseHandler;

    /// Replaces the close handler.
    fn set_close_handler(&self, handler: CloseHandler);

    /// Sets the instant after which pending and future reads fail.
    fn set_read_deadline(&self, deadline: Instant) -> Result<()>;
}

// ============================================================================
// ReadDeadline
// ============================================================================

/// Read deadline shared between a transport's reader and its setters.
///
/// Reads in progress observe deadline changes.
pub(crate) struct ReadDeadline {
    tx: watch::Sender<Option<Instant>>,
}

impl ReadDeadline {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    pub(crate) fn set(&self, deadline: Instant) {
        self.tx.send_replace(Some(deadline));
    }

    pub(crate) fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Drives `fut` to completion unless the deadline passes first.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::pin!(fut);
        let mut changes = self.tx.subscribe();

        loop {
            let deadline = *changes.borrow_and_update();
            let expired = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                output = &mut fut => return Ok(output),
                () = expired => return Err(Error::DeadlineExceeded),
                Ok(()) = changes.changed() => continue,
            }
        }
    }
}

/// Resolves once the flag behind `rx` becomes `true`.
pub(crate) async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryPeer, MemoryTransport};
pub use server::WsListener;
pub use websocket::WsTransport;
