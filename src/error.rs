//! Error types for the connection pool.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ws_connpool::{ConnectionPool, Result};
//!
//! async fn notify(pool: &ConnectionPool, id: &str) -> Result<()> {
//!     pool.send(b"hello", id).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Validation | [`Error::InvalidArgument`], [`Error::InvalidPingMessage`], [`Error::InvalidPingWait`], [`Error::Config`] |
//! | Lookup | [`Error::ConnectionNotFound`] |
//! | Connection | [`Error::ConnectionClosed`], [`Error::DeadlineExceeded`], [`Error::Transport`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// A required argument was missing or empty.
    ///
    /// Returned for `None` transports, connections and callbacks, and for
    /// empty connection ids.
    #[error("{function} has invalid {argument} argument")]
    InvalidArgument {
        /// Operation that rejected the argument.
        function: &'static str,
        /// Name of the rejected argument.
        argument: &'static str,
    },

    /// Ping sentinel is empty or longer than the allowed maximum.
    ///
    /// When returned by a connection setter the connection has been closed.
    #[error("Invalid ping message: {length} bytes")]
    InvalidPingMessage {
        /// Length of the rejected sentinel.
        length: usize,
    },

    /// Ping wait is zero or exceeds the maximum keepalive window.
    ///
    /// When returned by a connection setter the connection has been closed.
    #[error("Invalid ping wait: {seconds}s")]
    InvalidPingWait {
        /// Rejected wait in seconds.
        seconds: u64,
    },

    /// Connection options failed validation.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No connection is registered under the id.
    #[error("Connection not found in pool: {id}")]
    ConnectionNotFound {
        /// The unknown connection id.
        id: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection was closed locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Read deadline elapsed before the next frame arrived.
    #[error("Read deadline exceeded")]
    DeadlineExceeded,

    /// Transport-level failure without a more specific source.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(function: &'static str, argument: &'static str) -> Self {
        Self::InvalidArgument { function, argument }
    }

    /// Creates an invalid ping message error.
    #[inline]
    pub fn invalid_ping_message(length: usize) -> Self {
        Self::InvalidPingMessage { length }
    }

    /// Creates an invalid ping wait error.
    #[inline]
    pub fn invalid_ping_wait(seconds: u64) -> Self {
        Self::InvalidPingWait { seconds }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(id: impl Into<String>) -> Self {
        Self::ConnectionNotFound { id: id.into() }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error was raised by argument validation.
    #[inline]
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. }
                | Self::InvalidPingMessage { .. }
                | Self::InvalidPingWait { .. }
                | Self::Config { .. }
        )
    }

    /// Returns `true` if this error came from the underlying connection.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::DeadlineExceeded
                | Self::Transport { .. }
                | Self::WebSocket(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if this is a keepalive timeout.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::invalid_argument("register", "id");
        assert_eq!(err.to_string(), "register has invalid id argument");
    }

    #[test]
    fn test_connection_not_found_display() {
        let err = Error::connection_not_found("c1");
        assert_eq!(err.to_string(), "Connection not found in pool: c1");
    }

    #[test]
    fn test_is_validation_error() {
        assert!(Error::invalid_ping_message(0).is_validation_error());
        assert!(Error::invalid_ping_wait(21).is_validation_error());
        assert!(Error::config("bad").is_validation_error());
        assert!(!Error::ConnectionClosed.is_validation_error());
        assert!(!Error::connection_not_found("x").is_validation_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::DeadlineExceeded.is_connection_error());
        assert!(Error::transport("broken pipe").is_connection_error());
        assert!(!Error::invalid_argument("new", "transport").is_connection_error());
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::DeadlineExceeded.is_timeout());
        assert!(!Error::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
