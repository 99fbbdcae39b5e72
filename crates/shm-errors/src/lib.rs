//! Shared error taxonomy for the SHM sensor gateway.
//!
//! Mirrors the error classes described in the gateway's error-handling design: framing
//! errors are recovered locally and never reach this crate as a propagated `Result`;
//! protocol, storer and connection errors are typed here so each crate can log and
//! continue, or hand the error up to [`GatewayError`] at the orchestration layer.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod connection;
pub mod framing;
pub mod protocol;
pub mod storer;

pub use connection::ConnectionError;
pub use framing::FramingError;
pub use protocol::ProtocolError;
pub use storer::StorerError;

use thiserror::Error;

/// Top-level error composing every subsystem's error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A frame or header failed to decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The frame extractor was misconfigured.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The storer failed to persist or rotate a file.
    #[error(transparent)]
    Storer(#[from] StorerError),

    /// A connection-level fault (accept/read/first-packet timeout, peer close).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Configuration was missing or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Build a configuration error.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}

/// Convenience alias for fallible gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
