//! Errors raised while decoding wire-protocol structures.

use thiserror::Error;

/// Errors from header/report decoding.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Header buffer was shorter than the minimum 36 bytes.
    #[error("header too short: got {len} bytes, need at least 36")]
    ShortHeader {
        /// Number of bytes actually available.
        len: usize,
    },

    /// Report record buffer was shorter than `report_len`.
    #[error("report record too short: got {len} bytes, need {expected}")]
    ShortReport {
        /// Number of bytes actually available.
        len: usize,
        /// Number of bytes a report record requires.
        expected: usize,
    },

    /// Header CRC-32 trailer did not match the computed checksum.
    #[error("header CRC32 mismatch: stored=0x{stored:08X}, computed=0x{computed:08X}")]
    CrcMismatch {
        /// CRC stored in the header trailer.
        stored: u32,
        /// CRC computed over bytes 0..35.
        computed: u32,
    },

    /// Channel map string was not exactly 8 digit characters in `1..=5`.
    #[error("invalid channel map: {0:?}")]
    InvalidChannelMap(String),
}

impl ProtocolError {
    /// Build a short-header error.
    #[must_use]
    pub fn short_header(len: usize) -> Self {
        Self::ShortHeader { len }
    }

    /// Build a short-report error.
    #[must_use]
    pub fn short_report(len: usize, expected: usize) -> Self {
        Self::ShortReport { len, expected }
    }

    /// Build a CRC-mismatch error.
    #[must_use]
    pub fn crc_mismatch(stored: u32, computed: u32) -> Self {
        Self::CrcMismatch { stored, computed }
    }

    /// Build an invalid-channel-map error.
    #[must_use]
    pub fn invalid_channel_map(map: impl Into<String>) -> Self {
        Self::InvalidChannelMap(map.into())
    }
}

/// Specialized result type for protocol decoding.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
