//! Errors raised while configuring the streaming frame extractor.

use thiserror::Error;

/// Configuration errors for [`shm_framer`](../shm_framer/index.html)'s `Framer`.
#[derive(Debug, Clone, Error)]
pub enum FramingError {
    /// `header_len` must be 36 (no CRC) or 40 (CRC-32 trailer).
    #[error("invalid header length: {len} (must be 36 or 40)")]
    InvalidHeaderLen {
        /// The rejected header length.
        len: usize,
    },
}

impl FramingError {
    /// Build an invalid-header-length error.
    #[must_use]
    pub fn invalid_header_len(len: usize) -> Self {
        Self::InvalidHeaderLen { len }
    }
}

/// Specialized result type for framer configuration.
pub type FramingResult<T> = std::result::Result<T, FramingError>;
