//! ws-connpool - Bidirectional WebSocket connection registry.
//!
//! Wraps persistent message-framed connections so an upstream router can
//! address them by string id.
//!
//! # Architecture
//!
//! - **[`Connection`]**: owns one transport and one receive loop. Filters
//!   the ping sentinel, refreshes the read deadline on each ping, hands other
//!   payloads to a receive callback, and tears down on any read error.
//! - **[`ConnectionPool`]**: maps ids to connections, sends by id, forwards
//!   ping configuration, and unregisters connections as they close.
//! - **[`Transport`]**: the capability set a connection needs. Implemented
//!   by [`WsTransport`] (tokio-tungstenite) and [`MemoryTransport`].
//!
//! A connection whose peer sends no ping within the keepalive window
//! (20 seconds by default) is closed. Data frames do not count as pings.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//!
//! use ws_connpool::{Connection, ConnectionPool, Result, WsListener};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = ConnectionPool::new();
//!     pool.set_receive_callback(|payload, id| {
//!         println!("{id}: {}", String::from_utf8_lossy(&payload));
//!     });
//!
//!     let listener = WsListener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000).await?;
//!     let (transport, addr) = listener.accept().await?;
//!
//!     let id = addr.to_string();
//!     let connection = Connection::new(Some(Arc::new(transport)), &id)?;
//!     pool.register(Some(connection), &id)?;
//!
//!     pool.send(b"welcome", &id).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`callbacks`] | Callback types and [`CloseCallbackRegistry`] |
//! | [`clock`] | Injectable time source |
//! | [`connection`] | [`Connection`] and its receive loop |
//! | [`dispatch`] | [`DispatchPolicy`] for receive callbacks |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`options`] | [`ConnectionOptions`] and keepalive limits |
//! | [`pool`] | [`ConnectionPool`] |
//! | [`transport`] | [`Transport`] trait and implementations |

// ============================================================================
// Modules
// ============================================================================

/// Callback types and the close-callback registry.
pub mod callbacks;

/// Injectable time source for read deadlines.
pub mod clock;

/// Connection wrapper with receive loop and ping keepalive.
pub mod connection;

/// Receive-callback execution policies.
pub mod dispatch;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Per-connection options.
pub mod options;

/// Connection pool keyed by string id.
pub mod pool;

/// Message-oriented transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Callback types
pub use callbacks::{CloseCallback, CloseCallbackRegistry, ReceiveCallback};

// Clock
pub use clock::{Clock, SystemClock};

// Connection types
pub use connection::Connection;
pub use pool::ConnectionPool;

// Configuration
pub use dispatch::DispatchPolicy;
pub use options::ConnectionOptions;

// Error types
pub use error::{Error, Result};

// Transport types
pub use transport::{CloseHandler, MemoryPeer, MemoryTransport, Transport, WsListener, WsTransport};
