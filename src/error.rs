//! # Error Types
//!
//! Error handling for the transport core.
//!
//! Two layers of errors exist:
//! - [`TransportError`]: the crate's `Result` error for fallible API calls
//!   (configuration, binding, header decoding, TLS setup).
//! - [`ErrorKind`]: the stable, typed code attached to a closed connection and
//!   reported to [`NetworkErrorHandler`](crate::protocol::handler::NetworkErrorHandler)s.
//!
//! Socket-level failures never surface as `Err` from a send call. They close the
//! responsible connection and arrive asynchronously through error callbacks.
//!
//! ## Example Usage
//! ```rust
//! use network_transport::error::{TransportError, Result};
//! use network_transport::core::header::WireHeader;
//! use tracing::error;
//!
//! fn decode(bytes: &[u8]) -> Result<WireHeader> {
//!     WireHeader::decode(bytes)
//! }
//!
//! match decode(&[0u8; 4]) {
//!     Ok(_) => {}
//!     Err(TransportError::Truncated { needed, available }) => {
//!         error!(needed, available, "short header");
//!     }
//!     Err(e) => error!(error=%e, "decode failed"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection lifecycle messages
    pub const ERR_SOCKET_CLOSED: &str = "socket closed";
    pub const ERR_NO_ROUTE: &str = "no route to host";
    pub const ERR_PEER_RESET: &str = "peer reset";
    pub const ERR_CONNECTION_IDLE: &str = "connection idle";
    pub const ERR_CONNECTION_REJECTED: &str = "connection rejected";
    pub const ERR_CONNECTION_CLOSED: &str = "connection closed";
    pub const ERR_TRANSPORT_SHUTDOWN: &str = "transport shut down";

    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "invalid wire header";
    pub const ERR_OVERSIZED_MESSAGE: &str = "message exceeds maximum size";

    /// TLS errors
    pub const ERR_TLS_NO_PEER_CERT: &str = "peer presented no certificate";
    pub const ERR_TLS_BAD_CERT: &str = "unable to parse peer certificate";
    pub const ERR_TLS_HOSTNAME: &str = "certificate common name does not match peer hostname";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Stable error codes carried by closed connections and error callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorKind {
    /// Internal graceful-close marker; never reported to error handlers.
    #[default]
    NonError,
    ConnectError,
    ReadError,
    WriteError,
    TlsError,
    /// The peer (or the local acceptor) rejected the connection's token.
    NotAccepted,
}

impl ErrorKind {
    /// Numeric code, stable across releases.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::NonError => 0,
            ErrorKind::ConnectError => 1,
            ErrorKind::ReadError => 2,
            ErrorKind::WriteError => 3,
            ErrorKind::TlsError => 4,
            ErrorKind::NotAccepted => 5,
        }
    }

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ErrorKind::NonError),
            1 => Some(ErrorKind::ConnectError),
            2 => Some(ErrorKind::ReadError),
            3 => Some(ErrorKind::WriteError),
            4 => Some(ErrorKind::TlsError),
            5 => Some(ErrorKind::NotAccepted),
            _ => None,
        }
    }

    /// Whether a connection closed with this kind is queued for error notification.
    pub fn is_reported(self) -> bool {
        !matches!(self, ErrorKind::NonError | ErrorKind::NotAccepted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NonError => "NON_ERROR",
            ErrorKind::ConnectError => "CONNECT_ERROR",
            ErrorKind::ReadError => "READ_ERROR",
            ErrorKind::WriteError => "WRITE_ERROR",
            ErrorKind::TlsError => "TLS_ERROR",
            ErrorKind::NotAccepted => "NOT_ACCEPTED",
        };
        f.write_str(name)
    }
}

// TransportError is the primary error type for fallible transport operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Invalid wire header")]
    InvalidHeader,

    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Message too large: {0} bytes")]
    OversizedMessage(usize),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Transport is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
