//! Error types for the discovery stream client.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on failure kinds.

use thiserror::Error;

/// Result type for discovery stream operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised while subscribing to a discovery stream.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Stream endpoint URL could not be built
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),

    /// Server answered with a non-success status
    #[error("HTTP {status} from stream endpoint")]
    Http { status: u16 },

    /// Transport dropped mid-stream
    #[error("network error: {0}")]
    Network(String),

    /// A stream payload could not be decoded
    #[error("parse error: {0}")]
    Parse(String),

    /// Snapshot file could not be read or written
    #[error("snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),
}
