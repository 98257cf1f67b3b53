//! Error types for the CIO HTTP engine.
//!
//! Every failure surfaced by [`execute`](crate::client::CioEngine::execute) is one of the
//! [`EngineError`] variants below, so callers can tell retryable conditions
//! (a timed-out dial, a keep-alive connection the peer had already closed) apart
//! from hard protocol violations.
//!
//! # Error Kinds
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | [`EngineError::ConnectTimeout`] | Every connect attempt timed out |
//! | [`EngineError::Connect`] | The OS refused or failed the dial |
//! | [`EngineError::Handshake`] | The secure transport failed to upgrade the connection |
//! | [`EngineError::Protocol`] | Malformed status line, header block, or chunk framing |
//! | [`EngineError::PrematureClose`] | The peer closed in the middle of a response |
//! | [`EngineError::ConnectionClosed`] | The connection closed before any byte of the response arrived |
//! | [`EngineError::UnsupportedBodyType`] | An upgrade body was used outside an upgrade exchange |

use std::io;
use std::string::FromUtf8Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the HTTP engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// All connect attempts timed out.
    #[error("connect timed out after {attempts} attempt(s)")]
    ConnectTimeout {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The connection could not be established (refused, unreachable, ...).
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The secure transport failed to complete its handshake.
    #[error("tls handshake failed: {0}")]
    Handshake(String),

    /// The peer sent something that is not valid HTTP/1.1.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection before a complete response was read.
    #[error("connection closed before the response was complete")]
    PrematureClose,

    /// The connection closed before any byte of the response arrived, or was
    /// torn down while the request was still waiting for its response.
    #[error("connection closed before the request was answered")]
    ConnectionClosed,

    /// A body type was used in a context that cannot carry it.
    #[error("unsupported body type: {0}")]
    UnsupportedBodyType(String),

    /// The request URL cannot be dispatched.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// I/O error on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A body was not valid UTF-8.
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),

    /// The engine was closed.
    #[error("engine is closed")]
    EngineClosed,
}

impl EngineError {
    /// Build a protocol error from anything printable.
    pub fn protocol(message: impl Into<String>) -> Self {
        EngineError::Protocol(message.into())
    }

    /// Whether repeating the request on a fresh connection may succeed.
    ///
    /// Protocol violations and body type errors are never retryable; a timed-out
    /// dial or a keep-alive connection the peer closed underneath us are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectTimeout { .. } | EngineError::ConnectionClosed
        )
    }
}
