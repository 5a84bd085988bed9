//! Connection pool keyed by string id.
//!
//! Lets an upstream router send to, and receive from, many connections by id.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ConnectionPool              │
//! │  ┌────────────────────────────────────┐  │
//! │  │ "c1" → Connection → Transport      │  │
//! │  │ "c2" → Connection → Transport      │  │
//! │  └────────────────────────────────────┘  │
//! │  receive callback (copied on register)   │
//! │  close callbacks: [unregister, ...]      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Each registered connection gets the pool's receive callback as it is at
//! registration time; replacing it later only affects connections registered
//! afterwards. Each connection's teardown runs the pool's close callbacks in
//! order, the first of which removes the entry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::callbacks::{CloseCallback, CloseCallbackRegistry, ReceiveCallback, noop_receive};
use crate::connection::Connection;
use crate::error::{Error, Result};

// ============================================================================
// ConnectionPool
// ============================================================================

/// Registry of open connections by id.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new();
/// pool.set_receive_callback(|payload, id| println!("{id}: {payload:?}"));
///
/// let connection = Connection::new(Some(Arc::new(transport)), "c1")?;
/// pool.register(Some(connection), "c1")?;
///
/// pool.send(b"hello", "c1").await?;
/// ```
pub struct ConnectionPool {
    /// Registered connections.
    connections: Mutex<FxHashMap<String, Arc<Connection>>>,

    /// Receive callback handed to connections on registration.
    receive_callback: RwLock<ReceiveCallback>,

    /// Close callbacks; the first one unregisters the connection.
    close_callbacks: Arc<CloseCallbackRegistry>,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|pool: &Weak<Self>| {
            let pool = pool.clone();
            let unregister: CloseCallback = Arc::new(move |id: &str| {
                if let Some(pool) = pool.upgrade() {
                    pool.unregister(id);
                }
            });

            Self {
                connections: Mutex::new(FxHashMap::default()),
                receive_callback: RwLock::new(noop_receive()),
                close_callbacks: Arc::new(CloseCallbackRegistry::with_first(unregister)),
            }
        })
    }
}

// ============================================================================
// ConnectionPool - Registration
// ============================================================================

impl ConnectionPool {
    /// Registers `connection` under `id`.
    ///
    /// Wires the connection's receive callback to the pool's current one and
    /// its close callback to the pool's close callbacks. Both are called with
    /// `id`, the key [`send`](Self::send) accepts, whatever id the connection
    /// itself was created with.
    ///
    /// Registering a second connection under an `id` already in use replaces
    /// the entry. The previous connection is not closed; it stays open but is
    /// detached, so its teardown no longer affects the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `connection` is `None` or `id` is empty
    /// - [`Error::ConnectionClosed`] if `connection` is already closed
    pub fn register(&self, connection: Option<Arc<Connection>>, id: &str) -> Result<()> {
        let connection =
            connection.ok_or_else(|| Error::invalid_argument("register", "connection"))?;
        if id.is_empty() {
            return Err(Error::invalid_argument("register", "id"));
        }
        if connection.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let mut connections = self.connections.lock();

        let receive = self.receive_callback.read().clone();
        let key = id.to_string();
        connection.set_receive_callback(Arc::new(move |payload: Vec<u8>, _connection_id: &str| {
            receive(payload, &key);
        }));

        let registry = Arc::clone(&self.close_callbacks);
        let key = id.to_string();
        connection.set_close_callback(Arc::new(move |_connection_id: &str| registry.invoke(&key)));

        // closed while being wired up: its teardown saw the previous callback
        if connection.is_closing() {
            return Err(Error::ConnectionClosed);
        }

        if let Some(previous) = connections.insert(id.to_string(), Arc::clone(&connection))
            && !Arc::ptr_eq(&previous, &connection)
        {
            previous.detach_close_callback();
            warn!(connection_id = %id, "Id already registered, previous connection replaced");
        }

        info!(connection_id = %id, total = connections.len(), "Connection registered");
        Ok(())
    }

    /// Sets the receive callback for connections registered from now on.
    ///
    /// Connections already registered keep the callback they got at
    /// registration.
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(Vec<u8>, &str) + Send + Sync + 'static,
    {
        *self.receive_callback.write() = Arc::new(callback);
    }

    /// Appends a callback run with the connection id whenever a registered
    /// connection closes. It runs after the pool has removed the entry.
    ///
    /// The callback must not add close callbacks itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `callback` is `None`.
    pub fn add_close_callback(&self, callback: Option<CloseCallback>) -> Result<()> {
        self.close_callbacks.add(callback)
    }

    /// Removes closing connections. Runs as the first close callback.
    ///
    /// The entry under `id` is only removed if it belongs to a connection
    /// that is shutting down: a live connection registered under the same
    /// id in the meantime stays. Other ids the closing connection was
    /// registered under are removed as well.
    fn unregister(&self, id: &str) {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|_, connection| !connection.is_closing());

        let removed = before - connections.len();
        if removed > 0 {
            debug!(connection_id = %id, removed, "Connection unregistered");
        }
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns the connection registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if no connection is registered.
    pub fn get(&self, id: &str) -> Result<Arc<Connection>> {
        self.connections
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::connection_not_found(id))
    }

    /// Sends one frame to the connection registered under `id`.
    ///
    /// The pool lock is released before the write, so a stalled transport
    /// only blocks callers of the same connection.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionNotFound`] if no connection is registered
    /// - the connection's error if the write fails (the connection is closed
    ///   and unregistered)
    pub async fn send(&self, payload: &[u8], id: &str) -> Result<()> {
        let connection = self.get(id)?;
        connection.send(payload).await
    }

    /// Replaces the ping sentinel of the connection under `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPingMessage`] if `message` is empty, before any lookup
    /// - [`Error::ConnectionNotFound`] if no connection is registered
    /// - [`Error::InvalidPingMessage`] if `message` is longer than 4 bytes; the
    ///   connection is closed and unregistered
    pub async fn set_ping_message_for_connection(
        &self,
        message: impl Into<Vec<u8>>,
        id: &str,
    ) -> Result<()> {
        let message = message.into();
        if message.is_empty() {
            return Err(Error::invalid_ping_message(0));
        }

        let connection = self.get(id)?;
        connection.set_ping_message(message).await
    }

    /// Replaces the keepalive window of the connection under `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPingWait`] if `seconds` is zero, before any lookup
    /// - [`Error::ConnectionNotFound`] if no connection is registered
    /// - [`Error::InvalidPingWait`] if `seconds` exceeds 20; the connection is
    ///   closed and unregistered
    pub async fn set_ping_wait_for_connection(&self, seconds: u64, id: &str) -> Result<()> {
        if seconds < 1 {
            return Err(Error::invalid_ping_wait(seconds));
        }

        let connection = self.get(id)?;
        connection.set_ping_wait(seconds).await
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns `true` if a connection is registered under `id`.
    #[inline]
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.connections.lock().contains_key(id)
    }

    /// Returns the ids of all registered connections.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }
}

// ============================================================================
// ConnectionPool - Lifecycle
// ============================================================================

impl ConnectionPool {
    /// Closes the connection under `id`, which unregisters it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if no connection is registered.
    pub async fn close(&self, id: &str) -> Result<()> {
        let connection = self.get(id)?;
        connection.close().await;
        Ok(())
    }

    /// Closes every registered connection.
    pub async fn shutdown(&self) {
        info!("ConnectionPool shutting down");

        let connections: Vec<_> = self.connections.lock().drain().collect();

        for (id, connection) in connections {
            connection.close().await;
            debug!(connection_id = %id, "Connection closed during shutdown");
        }

        info!("ConnectionPool shutdown complete");
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("close_callbacks", &self.close_callbacks)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
