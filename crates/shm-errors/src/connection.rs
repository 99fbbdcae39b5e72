//! Connection-level faults surfaced from the socket server up to the node.
//!
//! These map directly onto the `on_error(msg)` message contract: the message text is
//! part of the external interface (scenario logs match against it), so
//! [`ConnectionError`]'s `Display` impl is authoritative wire text, not decoration.

use thiserror::Error;

/// A connection-level fault reported by the socket server to its owner.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No client connected within the accept-timeout window.
    #[error("Accept timeout: no client connected")]
    AcceptTimeout,

    /// A client was connected but stopped sending within the read-timeout window.
    #[error("Timeout while reading data")]
    ReadTimeout,

    /// No data arrived within the one-shot first-packet watchdog window.
    #[error("First-packet timeout ({timeout_s}s) — no data received")]
    FirstPacketTimeout {
        /// Configured timeout, in seconds.
        timeout_s: f64,
    },

    /// The peer closed the connection (zero-byte read).
    #[error("Connection closed by the client")]
    PeerClosed,

    /// The listening socket failed to bind or accept.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Build a first-packet-timeout error.
    #[must_use]
    pub fn first_packet_timeout(timeout_s: f64) -> Self {
        Self::FirstPacketTimeout { timeout_s }
    }
}

/// Specialized result type for connection-level operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
