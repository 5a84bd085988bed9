//! Delivery of inbound payloads to the receive callback.
//!
//! Each connection owns one [`Dispatcher`] built from its [`DispatchPolicy`].
//! The receive loop hands every non-ping payload to it and moves on to the
//! next read.
//!
//! | Policy | Ordering | Concurrency |
//! |--------|----------|-------------|
//! | `Unordered { max_in_flight: None }` | none | one task per message, unbounded |
//! | `Unordered { max_in_flight: Some(n) }` | none | at most `n` tasks per connection |
//! | `Ordered { queue_capacity }` | arrival order | one worker per connection |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace};

use crate::callbacks::ReceiveCallback;

// ============================================================================
// Constants
// ============================================================================

/// Default queue capacity for ordered dispatch.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// DispatchPolicy
// ============================================================================

/// How inbound payloads reach the receive callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Spawn an independent task per message.
    ///
    /// Delivery order between messages of one connection is not guaranteed.
    /// With `max_in_flight: None` the number of outstanding tasks is
    /// unbounded; with `Some(n)` the receive loop waits for a free slot.
    Unordered {
        /// Upper bound on concurrently running callback tasks.
        #[serde(default)]
        max_in_flight: Option<usize>,
    },

    /// Deliver messages one at a time, in arrival order.
    ///
    /// A full queue back-pressures the receive loop.
    Ordered {
        /// Number of payloads buffered ahead of the callback.
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
    },
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::Unordered {
            max_in_flight: None,
        }
    }
}

impl DispatchPolicy {
    /// Unbounded task-per-message dispatch.
    #[inline]
    #[must_use]
    pub const fn unordered() -> Self {
        Self::Unordered {
            max_in_flight: None,
        }
    }

    /// Task-per-message dispatch with at most `max_in_flight` running tasks.
    #[inline]
    #[must_use]
    pub const fn bounded(max_in_flight: usize) -> Self {
        Self::Unordered {
            max_in_flight: Some(max_in_flight),
        }
    }

    /// Serial in-order dispatch with the default queue capacity.
    #[inline]
    #[must_use]
    pub const fn ordered() -> Self {
        Self::Ordered {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Returns `true` if delivery preserves arrival order.
    #[inline]
    #[must_use]
    pub const fn is_ordered(&self) -> bool {
        matches!(self, Self::Ordered { .. })
    }

    /// Validates the policy parameters.
    ///
    /// # Errors
    ///
    /// Returns error message if a limit or capacity is zero.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Unordered {
                max_in_flight: Some(0),
            } => Err("max_in_flight must be greater than zero".to_string()),
            Self::Ordered { queue_capacity: 0 } => {
                Err("queue_capacity must be greater than zero".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Payload waiting for the ordered worker.
struct Job {
    callback: ReceiveCallback,
    payload: Vec<u8>,
}

enum DispatcherKind {
    Spawn { limit: Option<Arc<Semaphore>> },
    Queue { tx: Mutex<Option<mpsc::Sender<Job>>> },
}

/// Per-connection executor for receive callbacks.
pub(crate) struct Dispatcher {
    connection_id: Arc<str>,
    kind: DispatcherKind,
}

impl Dispatcher {
    /// Creates a dispatcher, spawning the ordered worker if the policy needs one.
    pub(crate) fn new(policy: DispatchPolicy, connection_id: Arc<str>) -> Self {
        let kind = match policy {
            DispatchPolicy::Unordered { max_in_flight } => DispatcherKind::Spawn {
                limit: max_in_flight.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            },
            DispatchPolicy::Ordered { queue_capacity } => {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                tokio::spawn(Self::run_worker(Arc::clone(&connection_id), rx));
                DispatcherKind::Queue {
                    tx: Mutex::new(Some(tx)),
                }
            }
        };

        Self {
            connection_id,
            kind,
        }
    }

    /// Hands a payload to the callback according to the policy.
    ///
    /// Waits only when the policy is bounded and currently saturated.
    pub(crate) async fn dispatch(&self, callback: ReceiveCallback, payload: Vec<u8>) {
        match &self.kind {
            DispatcherKind::Spawn { limit } => {
                let permit = match limit {
                    Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };

                let connection_id = Arc::clone(&self.connection_id);
                tokio::spawn(async move {
                    callback(payload, &connection_id);
                    drop(permit);
                });
            }

            DispatcherKind::Queue { tx } => {
                let Some(tx) = tx.lock().clone() else {
                    debug!(connection_id = %self.connection_id, "Dispatch queue closed, payload dropped");
                    return;
                };

                if tx.send(Job { callback, payload }).await.is_err() {
                    debug!(connection_id = %self.connection_id, "Dispatch worker gone, payload dropped");
                }
            }
        }
    }

    /// Stops accepting payloads. Queued payloads are still delivered.
    pub(crate) fn close(&self) {
        if let DispatcherKind::Queue { tx } = &self.kind {
            tx.lock().take();
        }
    }

    /// Serial worker for ordered dispatch.
    async fn run_worker(connection_id: Arc<str>, mut rx: mpsc::Receiver<Job>) {
        while let Some(Job { callback, payload }) = rx.recv().await {
            callback(payload, &connection_id);
        }

        trace!(connection_id = %connection_id, "Dispatch worker finished");
    }
}

// ============================================================================
// Tests
// ============================================================================
