//! Errors raised by the rotating accelerometer file writer.

use thiserror::Error;

/// Errors from [`shm_storer`](../shm_storer/index.html)'s file writer.
#[derive(Debug, Error)]
pub enum StorerError {
    /// `ts_abs` looked implausibly old (pre-2001) in either ms or µs units.
    #[error("implausible sample timestamp: {ts_abs} (looks pre-2001)")]
    InvalidTimestamp {
        /// The raw timestamp value that failed the sanity check.
        ts_abs: u64,
    },

    /// A filesystem operation (open/write/fsync/rename) failed.
    #[error("storer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorerError {
    /// Build an invalid-timestamp error.
    #[must_use]
    pub fn invalid_timestamp(ts_abs: u64) -> Self {
        Self::InvalidTimestamp { ts_abs }
    }
}

/// Specialized result type for storer operations.
pub type StorerResult<T> = std::result::Result<T, StorerError>;
