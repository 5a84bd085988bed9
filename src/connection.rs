//! Connection wrapper with receive loop and ping keepalive.
//!
//! A [`Connection`] owns one transport and one receive loop task. The loop
//! reads frames one at a time:
//!
//! - a frame equal to the ping sentinel pushes the read deadline to
//!   `now + ping_wait` and is not delivered;
//! - any other frame goes to the receive callback through the dispatcher;
//! - a read error (deadline expiry, peer close, I/O) tears the connection down.
//!
//! Only pings refresh the deadline. A peer that sends data but never pings
//! is disconnected once the keepalive window elapses.
//!
//! # Lifecycle
//!
//! Open → closed is one-way. Teardown closes the transport and runs the close
//! callback, each at most once, whichever path (read error, failed send,
//! invalid ping configuration, explicit [`Connection::close`], peer close
//! frame) gets there first.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::callbacks::{CloseCallback, ReceiveCallback, noop_close, noop_receive};
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::options::{ConnectionOptions, check_ping_message, check_ping_wait};
use crate::transport::{Transport, wait_until_set};

// ============================================================================
// CloseNotifier
// ============================================================================

/// Close callback plus its once-guard.
///
/// Shared with the transport's close handler, which may fire before the
/// receive loop notices the closed stream.
struct CloseNotifier {
    callback: RwLock<CloseCallback>,
    notified: AtomicBool,
}

impl CloseNotifier {
    fn notify(&self, id: &str) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.read().clone();
        callback(id);
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A transport registered under a string id, kept alive by pings.
///
/// Created with [`Connection::new`] or [`Connection::with_options`], which
/// spawn the receive loop; a tokio runtime must be running.
pub struct Connection {
    /// Connection id, immutable for the connection's lifetime.
    id: Arc<str>,
    /// Exclusively owned transport.
    transport: Arc<dyn Transport>,
    /// Callback for non-ping payloads.
    receive_callback: RwLock<ReceiveCallback>,
    /// Close callback, shared with the transport close handler.
    close_notifier: Arc<CloseNotifier>,
    /// Set once the transport close handler wraps the close callback.
    close_handler_chained: AtomicBool,
    /// Keepalive sentinel.
    ping_message: RwLock<Vec<u8>>,
    /// Keepalive window applied on each ping.
    ping_wait: Mutex<Duration>,
    /// Time source for deadlines.
    clock: Arc<dyn Clock>,
    /// Executor for receive callbacks.
    dispatcher: Dispatcher,
    /// Once-guard for teardown.
    closed: AtomicBool,
    /// Stops the receive loop.
    shutdown: watch::Sender<bool>,
}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Wraps `transport` with default options and starts the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `transport` is `None` or `id` is
    /// empty.
    pub fn new(transport: Option<Arc<dyn Transport>>, id: &str) -> Result<Arc<Self>> {
        Self::with_options(transport, id, ConnectionOptions::default())
    }

    /// Wraps `transport` with `options` and starts the receive loop.
    ///
    /// The initial read deadline is `now + options.ping_wait`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `transport` is `None` or `id` is empty
    /// - [`Error::Config`] if `options` fail validation
    pub fn with_options(
        transport: Option<Arc<dyn Transport>>,
        id: &str,
        options: ConnectionOptions,
    ) -> Result<Arc<Self>> {
        let transport =
            transport.ok_or_else(|| Error::invalid_argument("Connection::new", "transport"))?;
        if id.is_empty() {
            return Err(Error::invalid_argument("Connection::new", "id"));
        }
        options.validate()?;

        let id: Arc<str> = Arc::from(id);
        let ConnectionOptions {
            ping_message,
            ping_wait,
            dispatch,
            clock,
        } = options;

        let connection = Arc::new(Self {
            dispatcher: Dispatcher::new(dispatch, Arc::clone(&id)),
            id,
            transport,
            receive_callback: RwLock::new(noop_receive()),
            close_notifier: Arc::new(CloseNotifier {
                callback: RwLock::new(noop_close()),
                notified: AtomicBool::new(false),
            }),
            close_handler_chained: AtomicBool::new(false),
            ping_message: RwLock::new(ping_message),
            ping_wait: Mutex::new(ping_wait),
            clock,
            closed: AtomicBool::new(false),
            shutdown: watch::Sender::new(false),
        });

        debug!(connection_id = %connection.id, "Connection created");

        let deadline = connection.clock.now() + ping_wait;
        match connection.transport.set_read_deadline(deadline) {
            Ok(()) => {
                tokio::spawn(Arc::clone(&connection).run_receive_loop());
            }
            Err(e) => {
                error!(connection_id = %connection.id, error = %e, "Failed to set initial read deadline");
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { connection.close().await });
            }
        }

        Ok(connection)
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `true` once the connection has been torn down.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the current ping sentinel.
    #[must_use]
    pub fn ping_message(&self) -> Vec<u8> {
        self.ping_message.read().clone()
    }

    /// Returns the current keepalive window.
    #[must_use]
    pub fn ping_wait(&self) -> Duration {
        *self.ping_wait.lock()
    }

    /// Writes one frame to the transport.
    ///
    /// A failed write tears the connection down before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is already closed
    /// - the transport's error if the write fails
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        if let Err(e) = self.transport.send(payload).await {
            warn!(connection_id = %self.id, error = %e, "Send failed, closing connection");
            self.close().await;
            return Err(e);
        }

        trace!(connection_id = %self.id, len = payload.len(), "Frame sent");
        Ok(())
    }

    /// Sets the callback for inbound non-ping payloads.
    pub fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.receive_callback.write() = callback;
    }

    /// Sets the callback run with the connection id on teardown.
    ///
    /// The transport's existing close handler is wrapped so that a peer
    /// close frame runs this callback first, then the original handler.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        *self.close_notifier.callback.write() = callback;

        if self.close_handler_chained.swap(true, Ordering::SeqCst) {
            return;
        }

        let native = self.transport.close_handler();
        let notifier = Arc::clone(&self.close_notifier);
        let id = Arc::clone(&self.id);
        self.transport
            .set_close_handler(Arc::new(move |code: u16, reason: &str| {
                notifier.notify(&id);
                native(code, reason)
            }));
    }

    /// Replaces the ping sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPingMessage`] if `message` is empty or longer
    /// than 4 bytes. The connection is closed in that case.
    pub async fn set_ping_message(&self, message: impl Into<Vec<u8>>) -> Result<()> {
        let message = message.into();
        if let Err(e) = check_ping_message(&message) {
            warn!(connection_id = %self.id, len = message.len(), "Invalid ping message, closing connection");
            self.close().await;
            return Err(e);
        }

        *self.ping_message.write() = message;
        Ok(())
    }

    /// Replaces the keepalive window, effective from the next ping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPingWait`] if `seconds` is zero or above 20.
    /// The connection is closed in that case.
    pub async fn set_ping_wait(&self, seconds: u64) -> Result<()> {
        match check_ping_wait(seconds) {
            Ok(wait) => {
                *self.ping_wait.lock() = wait;
                Ok(())
            }
            Err(e) => {
                warn!(connection_id = %self.id, seconds, "Invalid ping wait, closing connection");
                self.close().await;
                Err(e)
            }
        }
    }

    /// Tears the connection down.
    ///
    /// Closes the transport and runs the close callback with the connection
    /// id. Later calls are no-ops. A transport close error is logged, not
    /// returned. Callback tasks already dispatched keep running.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.send_replace(true);
        self.dispatcher.close();

        if let Err(e) = self.transport.close().await {
            error!(connection_id = %self.id, error = %e, "Failed to close transport");
        }

        self.close_notifier.notify(&self.id);

        debug!(connection_id = %self.id, "Connection closed");
    }

    /// Returns `true` once the close callback has run or teardown started.
    pub(crate) fn is_closing(&self) -> bool {
        self.is_closed() || self.close_notifier.notified.load(Ordering::SeqCst)
    }

    /// Replaces the close callback with a no-op without touching the transport.
    pub(crate) fn detach_close_callback(&self) {
        *self.close_notifier.callback.write() = noop_close();
    }
}

// ============================================================================
// Connection - Receive Loop
// ============================================================================

impl Connection {
    /// Reads frames until the transport fails or the connection is closed.
    ///
    /// A dispatch waiting on a saturated policy is abandoned on close, so a
    /// callback that never returns cannot pin the loop.
    async fn run_receive_loop(self: Arc<Self>) {
        debug!(connection_id = %self.id, "Receive loop started");

        let stopped = wait_until_set(self.shutdown.subscribe());
        tokio::pin!(stopped);

        loop {
            let frame = tokio::select! {
                biased;
                () = &mut stopped => break,
                frame = self.transport.receive() => frame,
            };

            let payload = match frame {
                Ok(payload) => payload,
                Err(e) => {
                    if matches!(e, Error::DeadlineExceeded | Error::ConnectionClosed) {
                        debug!(connection_id = %self.id, error = %e, "Read ended");
                    } else {
                        warn!(connection_id = %self.id, error = %e, "Failed to read from transport");
                    }
                    self.close().await;
                    break;
                }
            };

            if self.is_ping(&payload) {
                self.refresh_deadline();
                continue;
            }

            let callback = self.receive_callback.read().clone();
            tokio::select! {
                biased;
                () = &mut stopped => break,
                () = self.dispatcher.dispatch(callback, payload) => {}
            }
        }

        debug!(connection_id = %self.id, "Receive loop ended");
    }

    fn is_ping(&self, payload: &[u8]) -> bool {
        self.ping_message.read().as_slice() == payload
    }

    fn refresh_deadline(&self) {
        let deadline = self.clock.now() + self.ping_wait();
        if let Err(e) = self.transport.set_read_deadline(deadline) {
            error!(connection_id = %self.id, error = %e, "Failed to refresh read deadline");
            return;
        }
        trace!(connection_id = %self.id, "Ping received, read deadline refreshed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("ping_wait", &self.ping_wait())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    use crate::dispatch::DispatchPolicy;
    use crate::transport::{MemoryPeer, MemoryTransport};

    type Log = Arc<Mutex<Vec<Vec<u8>>>>;

    fn open(id: &str) -> (Arc<Connection>, MemoryPeer) {
        open_with(id, ConnectionOptions::default())
    }

    fn open_with(id: &str, options: ConnectionOptions) -> (Arc<Connection>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let connection =
            Connection::with_options(Some(Arc::new(transport)), id, options).expect("valid connection");
        (connection, peer)
    }

    fn record_payloads(connection: &Connection) -> Log {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        connection.set_receive_callback(Arc::new(move |payload: Vec<u8>, _id: &str| {
            sink.lock().push(payload);
        }));
        log
    }

    fn record_closes(connection: &Connection) -> Arc<Mutex<Vec<String>>> {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closes);
        connection.set_close_callback(Arc::new(move |id: &str| sink.lock().push(id.to_string())));
        closes
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn test_new_rejects_missing_transport() {
        let result = Connection::new(None, "c1");
        assert!(matches!(result, Err(Error::InvalidArgument { argument: "transport", .. })));
    }

    #[tokio::test]
    async fn test_new_rejects_empty_id() {
        let (transport, _peer) = MemoryTransport::pair();
        let result = Connection::new(Some(Arc::new(transport)), "");
        assert!(matches!(result, Err(Error::InvalidArgument { argument: "id", .. })));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_options() {
        let (transport, _peer) = MemoryTransport::pair();
        let options = ConnectionOptions::new().with_ping_message("");
        let result = Connection::with_options(Some(Arc::new(transport)), "c1", options);
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_sets_initial_deadline() {
        let start = Instant::now();
        let (connection, peer) = open("c1");

        assert_eq!(connection.id(), "c1");
        assert_eq!(connection.ping_message(), b".");
        assert_eq!(connection.ping_wait(), Duration::from_secs(20));
        assert_eq!(peer.read_deadline(), Some(start + Duration::from_secs(20)));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_ping_is_filtered_and_data_is_delivered() {
        let (connection, peer) = open("c1");
        let log = record_payloads(&connection);

        assert_ok!(peer.send("hello"));
        assert_ok!(peer.send("."));
        assert_ok!(peer.send("world"));

        eventually(|| log.lock().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut seen = log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![b"hello".to_vec(), b"world".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_refreshes_deadline() {
        let start = Instant::now();
        let (connection, peer) = open("c1");
        let log = record_payloads(&connection);
        assert_ok!(connection.set_ping_wait(5).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_ok!(peer.send("."));

        eventually(|| peer.read_deadline() != Some(start + Duration::from_secs(20))).await;

        let deadline = peer.read_deadline().expect("deadline set");
        assert!(deadline >= start + Duration::from_secs(15));
        assert!(deadline < start + Duration::from_secs(20));
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_connection_alive() {
        let (connection, peer) = open("c1");

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_ok!(peer.send("."));
        }

        assert!(!connection.is_closed());
        assert!(!peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_without_pings_expires() {
        let start = Instant::now();
        let (connection, peer) = open("c1");
        let log = record_payloads(&connection);
        let closes = record_closes(&connection);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            assert_ok!(peer.send("data"));
        }

        tokio::time::timeout(Duration::from_secs(30), peer.closed())
            .await
            .expect("connection closed by keepalive");

        assert!(Instant::now() - start >= Duration::from_secs(20));
        assert!(connection.is_closed());
        eventually(|| log.lock().len() == 4).await;
        assert_eq!(*closes.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_send_reaches_transport_once() {
        let (connection, peer) = open("c1");

        assert_ok!(connection.send(b"payload").await);

        assert_eq!(peer.recv().await, Some(b"payload".to_vec()));
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_send_failure_closes_connection() {
        let (connection, peer) = open("c1");
        let closes = record_closes(&connection);
        peer.fail_writes(true);

        let err = connection.send(b"x").await.expect_err("write fails");
        assert!(matches!(err, Error::Transport { .. }));
        assert!(connection.is_closed());
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(*closes.lock(), vec!["c1".to_string()]);

        peer.fail_writes(false);
        assert!(matches!(
            connection.send(b"y").await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_ping_message_closes_connection() {
        for invalid in [&b""[..], &b"hello"[..]] {
            let (connection, peer) = open("c1");
            let closes = record_closes(&connection);

            let err = connection
                .set_ping_message(invalid)
                .await
                .expect_err("invalid sentinel");
            assert!(matches!(err, Error::InvalidPingMessage { .. }));
            assert!(connection.is_closed());
            assert!(peer.is_closed());
            assert_eq!(closes.lock().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_invalid_ping_wait_closes_connection() {
        for invalid in [0, 21] {
            let (connection, peer) = open("c1");

            let err = connection
                .set_ping_wait(invalid)
                .await
                .expect_err("invalid wait");
            assert!(matches!(err, Error::InvalidPingWait { .. }));
            assert!(connection.is_closed());
            assert!(peer.is_closed());
        }
    }

    #[tokio::test]
    async fn test_custom_ping_message_changes_filtering() {
        let (connection, peer) = open("c1");
        let log = record_payloads(&connection);

        assert_ok!(connection.set_ping_message("hb").await);
        assert_eq!(connection.ping_message(), b"hb");

        assert_ok!(peer.send("hb"));
        assert_ok!(peer.send("."));

        eventually(|| log.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*log.lock(), vec![b".".to_vec()]);
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_valid_ping_wait_updates_window() {
        let (connection, _peer) = open("c1");
        assert_ok!(connection.set_ping_wait(20).await);
        assert_ok!(connection.set_ping_wait(1).await);
        assert_eq!(connection.ping_wait(), Duration::from_secs(1));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connection, peer) = open("c1");
        let closes = record_closes(&connection);

        tokio::join!(connection.close(), connection.close(), connection.close());
        connection.close().await;

        assert_eq!(peer.close_calls(), 1);
        assert_eq!(closes.lock().len(), 1);
        assert_err!(connection.send(b"late").await);
    }

    #[tokio::test]
    async fn test_peer_close_runs_callback_then_native_handler_once() {
        let (transport, peer) = MemoryTransport::pair();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            transport.set_close_handler(Arc::new(move |code: u16, _reason: &str| {
                order.lock().push(format!("native:{code}"));
                Ok(())
            }));
        }

        let connection = Connection::new(Some(Arc::new(transport)), "c1").expect("valid connection");
        {
            let order = Arc::clone(&order);
            connection.set_close_callback(Arc::new(move |id: &str| {
                order.lock().push(format!("callback:{id}"));
            }));
        }

        assert_ok!(peer.send_close(1000, "bye"));
        peer.closed().await;
        eventually(|| connection.is_closed()).await;

        assert_eq!(*order.lock(), vec!["callback:c1", "native:1000"]);
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_connection() {
        let (connection, peer) = open("c1");
        let closes = record_closes(&connection);

        drop(peer);

        eventually(|| connection.is_closed()).await;
        assert_eq!(*closes.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_ordered_dispatch_preserves_order() {
        let options = ConnectionOptions::new().with_dispatch(DispatchPolicy::ordered());
        let (connection, peer) = open_with("c1", options);
        let log = record_payloads(&connection);

        for i in 0..100u8 {
            assert_ok!(peer.send(vec![i]));
        }

        eventually(|| log.lock().len() == 100).await;
        let seen: Vec<u8> = log.lock().iter().map(|p| p[0]).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_releases_loop_blocked_on_saturated_dispatch() {
        let policies = [
            DispatchPolicy::bounded(1),
            DispatchPolicy::Ordered { queue_capacity: 1 },
        ];

        for policy in policies {
            let options = ConnectionOptions::new().with_dispatch(policy);
            let (connection, peer) = open_with("c1", options);

            let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
            let release_rx = Arc::new(Mutex::new(release_rx));
            let started = Arc::new(AtomicBool::new(false));
            {
                let started = Arc::clone(&started);
                connection.set_receive_callback(Arc::new(move |_payload: Vec<u8>, _id: &str| {
                    started.store(true, Ordering::SeqCst);
                    let _ = release_rx.lock().recv();
                }));
            }

            for frame in ["one", "two", "three"] {
                assert_ok!(peer.send(frame));
            }
            eventually(|| started.load(Ordering::SeqCst)).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            connection.close().await;

            // the receive loop task holds the only other reference
            eventually(|| Arc::strong_count(&connection) == 1).await;
            drop(release_tx);
        }
    }
}
