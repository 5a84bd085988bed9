//! Callback types and the close-callback registry.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked with each inbound non-ping payload and the connection id.
pub type ReceiveCallback = Arc<dyn Fn(Vec<u8>, &str) + Send + Sync>;

/// Callback invoked with the connection id when a connection terminates.
pub type CloseCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns a receive callback that discards every payload.
#[must_use]
pub fn noop_receive() -> ReceiveCallback {
    Arc::new(|_payload: Vec<u8>, _id: &str| {})
}

/// Returns a close callback that does nothing.
#[must_use]
pub fn noop_close() -> CloseCallback {
    Arc::new(|_id: &str| {})
}

// ============================================================================
// CloseCallbackRegistry
// ============================================================================

/// Ordered set of callbacks run once per connection-close event.
///
/// Insertion order is invocation order. The registry lock is held for the
/// whole dispatch, so a callback must not call [`add`](Self::add) or
/// [`invoke`](Self::invoke) on the same registry: that deadlocks.
#[derive(Default)]
pub struct CloseCallbackRegistry {
    callbacks: Mutex<Vec<CloseCallback>>,
}

impl CloseCallbackRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose first callback is `first`.
    #[must_use]
    pub fn with_first(first: CloseCallback) -> Self {
        Self {
            callbacks: Mutex::new(vec![first]),
        }
    }

    /// Appends a callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `callback` is `None`.
    pub fn add(&self, callback: Option<CloseCallback>) -> Result<()> {
        let callback = callback.ok_or_else(|| Error::invalid_argument("add", "callback"))?;
        self.callbacks.lock().push(callback);
        Ok(())
    }

    /// Calls every registered callback in insertion order with `id`.
    pub fn invoke(&self, id: &str) {
        let callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback(id);
        }
    }

    /// Returns the number of registered callbacks.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Returns `true` if no callbacks are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl fmt::Debug for CloseCallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseCallbackRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
