//! 36-byte frame header decode/encode, plus the optional 4-byte CRC-32 trailer.

use shm_errors::{ProtocolError, ProtocolResult};

/// The two sync-word byte sequences accepted as valid frame starts.
pub const SYNC_WORDS: [[u8; 2]; 2] = [[0xA5, 0x5A], [0x5A, 0xA5]];

/// Header length without the CRC-32 trailer.
pub const HEADER_LEN_NO_CRC: usize = 36;

/// Header length including the CRC-32 trailer.
pub const HEADER_LEN_WITH_CRC: usize = 40;

/// The six opaque float32 metrics carried by every header, in wire order.
pub type HeaderMetrics = [f32; 6];

/// A decoded 36-byte frame header (see the gateway spec's data model for the bit
/// layout). CRC verification is the Framer's responsibility, not this decoder's: this
/// type only knows how to turn bytes into fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Sync word observed at the start of the frame.
    pub sync: [u8; 2],
    /// FFT flag (`pre1` bit 7).
    pub fft_flag: bool,
    /// STA/LTA flag (`pre1` bit 6).
    pub stalta_flag: bool,
    /// Data format (`pre1` bits 5..4), opaque to this core.
    pub data_format: u8,
    /// `nreports` (`pre1` bits 3..0); `0` means "use the configured default".
    pub nreports: u8,
    /// `chmax_pct` (`pre2` bits 1..0).
    pub chmax_pct: u8,
    /// Channel-mode flag (`pre2` bit 2): `false` = 8ch, `true` = 4ch.
    pub four_channel_mode: bool,
    /// Header-only flag (`pre2` bit 3): frame carries no payload when set.
    pub header_only: bool,
    /// Raw FFT timestamp, unit per the session's [`TsUnit`](crate::TsUnit) configuration.
    pub tstamp_fft_raw: u64,
    /// The six opaque metrics `[STA/LTA, MAX%, IQR, RMS, PEAK, CAV]`.
    pub metrics: HeaderMetrics,
}

impl FrameHeader {
    /// Decode a header from at least [`HEADER_LEN_NO_CRC`] bytes. Extra bytes (the CRC
    /// trailer, if present) are ignored; CRC verification happens in the Framer.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < HEADER_LEN_NO_CRC {
            return Err(ProtocolError::short_header(bytes.len()));
        }

        let pre1 = bytes[2];
        let pre2 = bytes[3];

        let fft_flag = (pre1 & 0b1000_0000) != 0;
        let stalta_flag = (pre1 & 0b0100_0000) != 0;
        let data_format = (pre1 & 0b0011_0000) >> 4;
        let nreports = pre1 & 0b0000_1111;

        let chmax_pct = pre2 & 0b0000_0011;
        let four_channel_mode = (pre2 & 0b0000_0100) != 0;
        let header_only = (pre2 & 0b0000_1000) != 0;

        let tstamp_fft_raw = u64::from_le_bytes(
            bytes[4..12]
                .try_into()
                .map_err(|_| ProtocolError::short_header(bytes.len()))?,
        );

        let mut metrics: HeaderMetrics = [0.0; 6];
        for (i, chunk) in bytes[12..36].chunks_exact(4).enumerate() {
            let arr: [u8; 4] = chunk
                .try_into()
                .map_err(|_| ProtocolError::short_header(bytes.len()))?;
            metrics[i] = f32::from_le_bytes(arr);
        }

        Ok(Self {
            sync: [bytes[0], bytes[1]],
            fft_flag,
            stalta_flag,
            data_format,
            nreports,
            chmax_pct,
            four_channel_mode,
            header_only,
            tstamp_fft_raw,
            metrics,
        })
    }

    /// Encode back to the 36-byte wire representation (no CRC trailer).
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN_NO_CRC] {
        let mut out = [0u8; HEADER_LEN_NO_CRC];
        out[0] = self.sync[0];
        out[1] = self.sync[1];

        let mut pre1 = (self.nreports & 0x0F) | ((self.data_format & 0x03) << 4);
        if self.stalta_flag {
            pre1 |= 0b0100_0000;
        }
        if self.fft_flag {
            pre1 |= 0b1000_0000;
        }
        out[2] = pre1;

        let mut pre2 = self.chmax_pct & 0x03;
        if self.four_channel_mode {
            pre2 |= 0b0000_0100;
        }
        if self.header_only {
            pre2 |= 0b0000_1000;
        }
        out[3] = pre2;

        out[4..12].copy_from_slice(&self.tstamp_fft_raw.to_le_bytes());
        for (i, value) in self.metrics.iter().enumerate() {
            let start = 12 + i * 4;
            out[start..start + 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Whether `candidate` is one of the two accepted sync words.
    #[must_use]
    pub fn is_sync_word(candidate: &[u8]) -> bool {
        candidate.len() >= 2 && SYNC_WORDS.iter().any(|s| s[0] == candidate[0] && s[1] == candidate[1])
    }
}

/// CRC-32/IEEE-802.3 (reflected, polynomial `0xEDB88320`) over arbitrary bytes.
#[must_use]
pub fn crc32_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute the expected CRC-32 trailer for a 40-byte header (bytes `0..36`).
///
/// Returns `None` if `header` is shorter than [`HEADER_LEN_WITH_CRC`].
#[must_use]
pub fn crc32_header_without_crc(header: &[u8]) -> Option<u32> {
    if header.len() < HEADER_LEN_WITH_CRC {
        return None;
    }
    Some(crc32_ieee(&header[..HEADER_LEN_NO_CRC]))
}

/// Read the little-endian CRC-32 trailer stored in bytes `36..40`.
///
/// Returns `None` if `header` is shorter than [`HEADER_LEN_WITH_CRC`].
#[must_use]
pub fn read_stored_crc(header: &[u8]) -> Option<u32> {
    header
        .get(36..40)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            sync: SYNC_WORDS[0],
            fft_flag: true,
            stalta_flag: true,
            data_format: 2,
            nreports: 10,
            chmax_pct: 3,
            four_channel_mode: false,
            header_only: false,
            tstamp_fft_raw: 1_700_000_000_000,
            metrics: [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        }
    }

    #[test]
    fn round_trip_encode_decode() {
        let header = sample_header();
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).expect("decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn short_header_is_rejected() {
        let bytes = vec![0u8; 10];
        assert!(FrameHeader::decode(&bytes).is_err());
    }

    #[test]
    fn nreports_zero_means_use_default() {
        let mut header = sample_header();
        header.nreports = 0;
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded).expect("decode");
        assert_eq!(decoded.nreports, 0);
    }

    #[test]
    fn crc_matches_reference_computation() {
        let header = sample_header();
        let encoded = header.encode();
        let crc = crc32_ieee(&encoded);

        let mut full = encoded.to_vec();
        full.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(crc32_header_without_crc(&full), Some(crc));
        assert_eq!(read_stored_crc(&full), Some(crc));
    }

    #[test]
    fn flipping_a_bit_changes_the_crc() {
        let header = sample_header();
        let mut encoded = header.encode();
        let original_crc = crc32_ieee(&encoded);
        encoded[5] ^= 0x01;
        assert_ne!(crc32_ieee(&encoded), original_crc);
    }

    #[test]
    fn sync_word_detection() {
        assert!(FrameHeader::is_sync_word(&[0xA5, 0x5A]));
        assert!(FrameHeader::is_sync_word(&[0x5A, 0xA5]));
        assert!(!FrameHeader::is_sync_word(&[0x00, 0x00]));
    }
}
