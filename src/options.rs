//! Keepalive and dispatch configuration for connections.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ws_connpool::{ConnectionOptions, DispatchPolicy};
//!
//! let options = ConnectionOptions::new()
//!     .with_ping_message("ping")
//!     .with_ping_wait(Duration::from_secs(10))
//!     .with_dispatch(DispatchPolicy::ordered());
//!
//! options.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::clock::{Clock, SystemClock};
use crate::dispatch::DispatchPolicy;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Ping sentinel used until one is configured.
pub const DEFAULT_PING_MESSAGE: &[u8] = b".";

/// Longest accepted ping sentinel, in bytes.
pub const MAX_PING_MESSAGE_LEN: usize = 4;

/// Longest accepted keepalive window.
pub const MAX_PING_WAIT: Duration = Duration::from_secs(20);

/// Keepalive window used until one is configured.
pub const DEFAULT_PING_WAIT: Duration = MAX_PING_WAIT;

// ============================================================================
// Validation
// ============================================================================

/// Checks a ping sentinel against the length bounds.
pub(crate) fn check_ping_message(message: &[u8]) -> Result<()> {
    if message.is_empty() || message.len() > MAX_PING_MESSAGE_LEN {
        return Err(Error::invalid_ping_message(message.len()));
    }
    Ok(())
}

/// Checks a ping wait in seconds and converts it to a duration.
pub(crate) fn check_ping_wait(seconds: u64) -> Result<Duration> {
    let wait = Duration::from_secs(seconds);
    if seconds < 1 || wait > MAX_PING_WAIT {
        return Err(Error::invalid_ping_wait(seconds));
    }
    Ok(wait)
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Per-connection keepalive and dispatch settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Exact bytes that mark an inbound frame as a keepalive ping.
    pub ping_message: Vec<u8>,

    /// Keepalive window. Applied as the initial read deadline and on every ping.
    pub ping_wait: Duration,

    /// How inbound payloads reach the receive callback.
    pub dispatch: DispatchPolicy,

    /// Time source for deadline computation.
    pub clock: Arc<dyn Clock>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ping_message: DEFAULT_PING_MESSAGE.to_vec(),
            ping_wait: DEFAULT_PING_WAIT,
            dispatch: DispatchPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// JSON shape of [`ConnectionOptions`].
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawOptions {
    ping_message: String,
    ping_wait_secs: u64,
    dispatch: DispatchPolicy,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            ping_message: String::from_utf8_lossy(DEFAULT_PING_MESSAGE).into_owned(),
            ping_wait_secs: DEFAULT_PING_WAIT.as_secs(),
            dispatch: DispatchPolicy::default(),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionOptions {
    /// Creates options with the default sentinel, window and dispatch policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON and validates them.
    ///
    /// Missing fields take their defaults:
    ///
    /// ```json
    /// { "ping_message": ".", "ping_wait_secs": 20, "dispatch": { "mode": "unordered" } }
    /// ```
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawOptions = serde_json::from_str(json)?;
        let options = Self {
            ping_message: raw.ping_message.into_bytes(),
            ping_wait: Duration::from_secs(raw.ping_wait_secs),
            dispatch: raw.dispatch,
            ..Self::default()
        };
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ConnectionOptions {
    /// Sets the ping sentinel.
    #[inline]
    #[must_use]
    pub fn with_ping_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.ping_message = message.into();
        self
    }

    /// Sets the keepalive window.
    #[inline]
    #[must_use]
    pub fn with_ping_wait(mut self, wait: Duration) -> Self {
        self.ping_wait = wait;
        self
    }

    /// Sets the dispatch policy.
    #[inline]
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchPolicy) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Sets the time source.
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ============================================================================
// Validation Methods
// ============================================================================

impl ConnectionOptions {
    /// Validates the options configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the sentinel, window or dispatch policy is
    /// out of range.
    pub fn validate(&self) -> Result<()> {
        check_ping_message(&self.ping_message).map_err(|_| {
            Error::config(format!(
                "ping_message must be 1..={MAX_PING_MESSAGE_LEN} bytes, got {}",
                self.ping_message.len()
            ))
        })?;

        if self.ping_wait < Duration::from_secs(1) || self.ping_wait > MAX_PING_WAIT {
            return Err(Error::config(format!(
                "ping_wait must be between 1s and {}s, got {:?}",
                MAX_PING_WAIT.as_secs(),
                self.ping_wait
            )));
        }

        self.dispatch.validate().map_err(Error::config)
    }
}

// ============================================================================
// Tests
// ============================================================================
