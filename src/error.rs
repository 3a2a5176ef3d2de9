//! Error types for sockio.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use sockio::{Manager, ManagerOptions, Result};
//!
//! async fn example() -> Result<()> {
//!     let manager = Manager::new("http://localhost:3000", ManagerOptions::new())?;
//!     manager.connect().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::NoTransportsAvailable`] |
//! | Transport | [`Error::Transport`], [`Error::Probe`], [`Error::ConnectionClosed`] |
//! | Session | [`Error::Handshake`], [`Error::PingTimeout`], [`Error::Server`] |
//! | Codec | [`Error::ProtocolDecode`], [`Error::IllegalAttachments`] |
//! | Connection | [`Error::ConnectionTimeout`], [`Error::Data`], [`Error::AckTimeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`], [`Error::Url`], [`Error::Base64`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::transport::TransportKind;

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
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when engine or manager options are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Every configured transport failed to construct.
    #[error("No transports available")]
    NoTransportsAvailable,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport-level I/O or protocol failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Upgrade probe failed or was aborted.
    #[error("Probe error ({transport}): {message}")]
    Probe {
        /// Candidate transport that was being probed.
        transport: TransportKind,
        /// Why the probe was abandoned.
        message: String,
    },

    /// Connection closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Malformed or unexpected `Open` handshake.
    #[error("Handshake error: {message}")]
    Handshake {
        /// Description of the handshake failure.
        message: String,
    },

    /// No frame arrived within `pingInterval + pingTimeout`.
    #[error("ping timeout")]
    PingTimeout,

    /// Server sent an application-level error frame.
    #[error("Server error: {message}")]
    Server {
        /// Error payload as sent by the server.
        message: String,
    },

    // ========================================================================
    // Codec Errors
    // ========================================================================
    /// Malformed session or application frame.
    #[error("Protocol decode error: {message}")]
    ProtocolDecode {
        /// Description of the decode failure.
        message: String,
    },

    /// A binary placeholder referenced a missing attachment.
    #[error("Illegal attachments: index {index} with {available} attachment(s)")]
    IllegalAttachments {
        /// Placeholder index found in the payload.
        index: u64,
        /// Number of attachments actually received.
        available: usize,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Connection attempt did not reach `Open` in time.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection-attempt failure surfaced to the caller of `connect`.
    #[error("{message}: {data}")]
    Data {
        /// Short description of the failed operation.
        message: String,
        /// Underlying failure.
        data: String,
    },

    /// Acknowledgement not received in time.
    #[error("Acknowledgement for '{event}' timed out after {timeout_ms}ms")]
    AckTimeout {
        /// Event that was emitted.
        event: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URI parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Base64 decode error.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a probe error.
    #[inline]
    pub fn probe(transport: TransportKind, message: impl Into<String>) -> Self {
        Self::Probe {
            transport,
            message: message.into(),
        }
    }

    /// Creates a handshake error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates a server error.
    #[inline]
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Creates a protocol decode error.
    #[inline]
    pub fn protocol_decode(message: impl Into<String>) -> Self {
        Self::ProtocolDecode {
            message: message.into(),
        }
    }

    /// Creates an illegal attachments error.
    #[inline]
    pub fn illegal_attachments(index: u64, available: usize) -> Self {
        Self::IllegalAttachments { index, available }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a data error wrapping a connection failure.
    #[inline]
    pub fn data(message: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
            data: data.into(),
        }
    }

    /// Creates an acknowledgement timeout error.
    #[inline]
    pub fn ack_timeout(event: impl Into<String>, timeout_ms: u64) -> Self {
        Self::AckTimeout {
            event: event.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::PingTimeout | Self::AckTimeout { .. }
        )
    }

    /// Returns `true` if this error came from decoding wire data.
    #[inline]
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolDecode { .. } | Self::IllegalAttachments { .. } | Self::Base64(_)
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::PingTimeout
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on a later connection attempt.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionTimeout { .. }
                | Self::PingTimeout
                | Self::Probe { .. }
                | Self::AckTimeout { .. }
        )
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
    fn test_error_display() {
        let err = Error::transport("xhr poll error");
        assert_eq!(err.to_string(), "Transport error: xhr poll error");
    }

    #[test]
    fn test_ping_timeout_display() {
        assert_eq!(Error::PingTimeout.to_string(), "ping timeout");
    }

    #[test]
    fn test_probe_error_display() {
        let err = Error::probe(TransportKind::WebSocket, "transport closed");
        assert_eq!(err.to_string(), "Probe error (websocket): transport closed");
    }

    #[test]
    fn test_data_error_display() {
        let err = Error::data("Connection Error", "timeout");
        assert_eq!(err.to_string(), "Connection Error: timeout");
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::connection_timeout(5000);
        let other_err = Error::transport("test");

        assert!(timeout_err.is_timeout());
        assert!(Error::PingTimeout.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_decode_error() {
        assert!(Error::protocol_decode("bad").is_decode_error());
        assert!(Error::illegal_attachments(3, 1).is_decode_error());
        assert!(!Error::ConnectionClosed.is_decode_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::transport("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::PingTimeout.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::connection_timeout(1000).is_recoverable());
        assert!(!Error::config("test").is_recoverable());
        assert!(!Error::NoTransportsAvailable.is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
