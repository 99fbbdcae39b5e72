//! Streaming byte-accurate frame extractor.
//!
//! A single growing buffer consumes arbitrary TCP chunks and yields complete frames —
//! header plus `nreports` report records, or header-only — handling partial reads,
//! garbage between frames, corrupted/misaligned sync words, and CRC-32 verification.
//! Grounded in `original_source/.../packet.py`'s `_validate_format_and_extract_frame`,
//! expressed with the buffer-owning struct idiom of `BufferedTCPReader` and CRC
//! verification via `crc32fast` as in the `redb-open` wire-header example.
//!
//! Framing never fails outright: malformed input is logged and resynchronized past,
//! matching the original's behavior of never raising out of the framing step.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shm_errors::{FramingError, FramingResult};
use shm_protocol::header::{crc32_header_without_crc, read_stored_crc, FrameHeader};
use tracing::warn;

const MISMATCH_LOG_MIN_INTERVAL: Duration = Duration::from_millis(300);
const BUFFER_WARN_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// A complete frame's raw bytes: a `header_len`-byte header (with CRC trailer if
/// enabled) followed by `nreports × report_len` bytes of payload, or just the header
/// when `header_only` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The full frame, header first.
    pub bytes: Vec<u8>,
}

impl Frame {
    /// The header portion (first `header_len` bytes).
    #[must_use]
    pub fn header_bytes(&self, header_len: usize) -> &[u8] {
        &self.bytes[..header_len.min(self.bytes.len())]
    }

    /// The payload portion (everything after `header_len`).
    #[must_use]
    pub fn payload_bytes(&self, header_len: usize) -> &[u8] {
        &self.bytes[header_len.min(self.bytes.len())..]
    }
}

/// Immutable framing configuration.
#[derive(Debug, Clone)]
pub struct FramerConfig {
    /// Header length in bytes: 36, or 40 with the CRC-32 trailer.
    pub header_len: usize,
    /// Report record length in bytes (52).
    pub report_len: usize,
    /// `nreports` used when the header carries `0` (sentinel for "use the default").
    pub nreports_default: u8,
    /// Whether the 4-byte CRC-32 trailer is present and checked.
    pub crc_enabled: bool,
    /// Strict mode resyncs immediately on CRC mismatch; lenient mode logs and
    /// continues parsing the (possibly corrupted) frame.
    pub crc_strict: bool,
    /// Hard cap on the internal buffer, in bytes.
    pub buffer_cap: usize,
}

impl FramerConfig {
    /// Validate and build a configuration.
    pub fn new(
        header_len: usize,
        report_len: usize,
        nreports_default: u8,
        crc_enabled: bool,
        crc_strict: bool,
        buffer_cap: usize,
    ) -> FramingResult<Self> {
        if header_len != 36 && header_len != 40 {
            return Err(FramingError::invalid_header_len(header_len));
        }
        Ok(Self {
            header_len,
            report_len,
            nreports_default,
            crc_enabled,
            crc_strict,
            buffer_cap,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BoundaryKind {
    Undersize,
    Oversize,
}

/// Streaming frame extractor. Owns the accumulation buffer; not thread-shared — one
/// instance per connection, driven by a single Reader/PacketHandler thread.
pub struct Framer {
    config: FramerConfig,
    buffer: Vec<u8>,
    last_buffer_warn: Option<Instant>,
    mismatch_throttle: HashMap<(usize, u8, bool, BoundaryKind), Instant>,
}

impl Framer {
    /// Build a new framer for the given configuration.
    #[must_use]
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            last_buffer_warn: None,
            mismatch_throttle: HashMap::new(),
        }
    }

    /// Feed newly-received bytes and drain every complete frame the buffer now
    /// contains.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);
        self.enforce_buffer_cap();

        let mut frames = Vec::new();
        while let Some(frame) = self.extract_one() {
            frames.push(frame);
        }
        frames
    }

    fn enforce_buffer_cap(&mut self) {
        if self.buffer.len() <= self.config.buffer_cap {
            return;
        }
        let keep = 2 * self.config.header_len;
        let start = self.buffer.len().saturating_sub(keep);
        self.buffer.drain(..start);

        let now = Instant::now();
        let should_warn = self
            .last_buffer_warn
            .is_none_or(|last| now.duration_since(last) >= BUFFER_WARN_MIN_INTERVAL);
        if should_warn {
            self.last_buffer_warn = Some(now);
            warn!(kept_bytes = keep, "framer buffer trimmed: cap reached");
        }
    }

    fn find_any_sync(&self, start: usize) -> Option<usize> {
        find_any_sync(&self.buffer, start)
    }

    fn extract_one(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }

        let Some(sync_at) = self.find_any_sync(0) else {
            self.buffer.drain(..self.buffer.len().saturating_sub(1));
            return None;
        };
        if sync_at > 0 {
            self.buffer.drain(..sync_at);
        }

        let header_len = self.config.header_len;
        if self.buffer.len() < header_len {
            return None;
        }

        if self.config.crc_enabled && header_len >= 40 {
            let header = &self.buffer[..header_len];
            if let (Some(stored), Some(computed)) =
                (read_stored_crc(header), crc32_header_without_crc(header))
            {
                if stored != computed {
                    warn!(stored, computed, "header CRC32 mismatch");
                    if self.config.crc_strict {
                        self.resync_from(1, "CRC mismatch");
                        return None;
                    }
                }
            }
        }

        let pre1 = self.buffer[2];
        let pre2 = self.buffer[3];
        let nreports_hdr = pre1 & 0x0F;
        let header_only = (pre2 >> 3) & 0x01 == 1;

        let nrep = if header_only {
            0
        } else if nreports_hdr > 0 {
            nreports_hdr
        } else {
            self.config.nreports_default
        };
        let expected_payload = if header_only {
            0
        } else {
            usize::from(nrep) * self.config.report_len
        };
        let expected_total = header_len + expected_payload;

        if self.buffer.len() < expected_total {
            return None;
        }

        if self.buffer.len() >= expected_total + 2 {
            let boundary = &self.buffer[expected_total..expected_total + 2];
            if !FrameHeader::is_sync_word(boundary) {
                if let Some(j1) = find_any_sync(&self.buffer, 2) {
                    if j1 != expected_total {
                        let kind = if j1 < expected_total {
                            BoundaryKind::Undersize
                        } else {
                            BoundaryKind::Oversize
                        };
                        self.log_boundary_mismatch(expected_total, nrep, header_only, kind, j1);
                        self.buffer.drain(..j1);
                        return None;
                    }
                } else {
                    self.resync_from(1, "header probably corrupt");
                    return None;
                }
            }
        }

        let frame_bytes: Vec<u8> = self.buffer.drain(..expected_total).collect();

        if self.buffer.len() >= 2 && !FrameHeader::is_sync_word(&self.buffer[..2]) {
            self.resync_from(1, "post-emit boundary desync");
        }

        Some(Frame { bytes: frame_bytes })
    }

    fn resync_from(&mut self, start: usize, reason: &str) {
        match find_any_sync(&self.buffer, start) {
            Some(j) => {
                if j > 0 {
                    warn!(dropped_bytes = j, reason, "frame boundary desync");
                }
                self.buffer.drain(..j);
            }
            None => {
                let dropped = self.buffer.len().saturating_sub(1);
                if dropped > 0 {
                    warn!(dropped_bytes = dropped, reason, "frame boundary desync, no next sync found");
                }
                let start = self.buffer.len().saturating_sub(1);
                self.buffer.drain(..start);
            }
        }
    }

    fn log_boundary_mismatch(
        &mut self,
        expected_total: usize,
        nrep: u8,
        header_only: bool,
        kind: BoundaryKind,
        resync_at: usize,
    ) {
        let key = (expected_total, nrep, header_only, kind);
        let now = Instant::now();
        let should_log = self
            .mismatch_throttle
            .get(&key)
            .is_none_or(|last| now.duration_since(*last) >= MISMATCH_LOG_MIN_INTERVAL);
        if should_log {
            self.mismatch_throttle.insert(key, now);
            warn!(
                ?kind,
                expected_total,
                nreports = nrep,
                header_only,
                resync_at,
                "frame boundary mismatch"
            );
        }
    }

    /// Number of bytes currently buffered (garbage plus any partial frame).
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_any_sync(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    (start..buf.len() - 1).find(|&i| FrameHeader::is_sync_word(&buf[i..i + 2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(crc_enabled: bool, crc_strict: bool) -> FramerConfig {
        FramerConfig::new(36, 52, 10, crc_enabled, crc_strict, 4 * 1024 * 1024).expect("valid config")
    }

    fn build_header(nreports: u8, header_only: bool) -> [u8; 36] {
        let mut h = [0u8; 36];
        h[0] = 0xA5;
        h[1] = 0x5A;
        h[2] = nreports & 0x0F;
        h[3] = if header_only { 0b0000_1000 } else { 0 };
        h
    }

    fn report(value: f32) -> [u8; 52] {
        let mut r = [0u8; 52];
        r[8..12].copy_from_slice(&value.to_le_bytes());
        r
    }

    #[test]
    fn extracts_single_complete_frame() {
        let mut framer = Framer::new(config(false, true));
        let mut data = build_header(1, false).to_vec();
        data.extend_from_slice(&report(1.0));

        let frames = framer.feed(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), 36 + 52);
    }

    #[test]
    fn waits_for_partial_header() {
        let mut framer = Framer::new(config(false, true));
        let header = build_header(1, false);
        let frames = framer.feed(&header[..20]);
        assert!(frames.is_empty());
        assert_eq!(framer.buffered_len(), 20);
    }

    #[test]
    fn drops_garbage_before_sync() {
        let mut framer = Framer::new(config(false, true));
        let mut data = vec![0xDE, 0xAD, 0xBE, 0xEF];
        data.extend_from_slice(&build_header(0, true));

        let frames = framer.feed(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), 36);
    }

    #[test]
    fn header_only_frame_has_no_payload() {
        let mut framer = Framer::new(config(false, true));
        let frames = framer.feed(&build_header(0, true));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), 36);
    }

    #[test]
    fn two_back_to_back_frames_both_extracted() {
        let mut framer = Framer::new(config(false, true));
        let mut data = build_header(1, false).to_vec();
        data.extend_from_slice(&report(1.0));
        data.extend_from_slice(&build_header(1, false));
        data.extend_from_slice(&report(2.0));

        let frames = framer.feed(&data);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn nreports_default_used_when_header_reports_zero_and_not_header_only() {
        let mut framer = Framer::new(config(false, true));
        let mut data = build_header(0, false).to_vec();
        for i in 0..10 {
            data.extend_from_slice(&report(i as f32));
        }

        let frames = framer.feed(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), 36 + 10 * 52);
    }

    #[test]
    fn crc_mismatch_in_strict_mode_drops_and_resyncs() {
        let mut framer = Framer::new(FramerConfig::new(40, 52, 10, true, true, 4096).expect("valid"));
        let mut header = build_header(1, false).to_vec();
        header.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // bogus CRC

        let mut next_header = build_header(1, false).to_vec();
        next_header.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());

        let mut data = header;
        data.extend_from_slice(&report(1.0));
        data.extend_from_slice(&next_header);
        data.extend_from_slice(&report(2.0));

        let frames = framer.feed(&data);
        // Both frames carry a bad CRC; strict mode resyncs past the corrupted frame
        // rather than emitting it, and stops the extraction pass at that point.
        assert!(frames.is_empty());
    }

    #[test]
    fn crc_match_in_strict_mode_emits_frame() {
        let mut header = build_header(1, false).to_vec();
        let crc = shm_protocol::header::crc32_ieee(&header);
        header.extend_from_slice(&crc.to_le_bytes());

        let mut framer = Framer::new(FramerConfig::new(40, 52, 10, true, true, 4096).expect("valid"));
        let mut data = header;
        data.extend_from_slice(&report(1.0));

        let frames = framer.feed(&data);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversized_boundary_triggers_resync_and_drops_frame() {
        let mut framer = Framer::new(config(false, true));
        // Claim 1 report but actually include 2 reports' worth of payload before the
        // next sync word, so the boundary check finds the real sync further out.
        let mut data = build_header(1, false).to_vec();
        data.extend_from_slice(&report(1.0));
        data.extend_from_slice(&report(2.0)); // extra, unexpected payload
        data.extend_from_slice(&build_header(1, false));
        data.extend_from_slice(&report(3.0));

        // A resync consumes only up to the discovered mismatch per extraction pass
        // (matching the original's one-shot-per-call behaviour); the trailing
        // well-formed frame surfaces on the next pass.
        let first_pass = framer.feed(&data);
        assert!(first_pass.is_empty());

        let second_pass = framer.feed(&[]);
        assert!(second_pass.iter().any(|f| f.bytes.len() == 36 + 52));
    }

    #[test]
    fn sync_free_run_collapses_to_one_retained_byte() {
        let mut framer = Framer::new(config(false, true));
        let garbage = vec![0x11u8; 500];

        let frames = framer.feed(&garbage);
        assert!(frames.is_empty());
        assert_eq!(framer.buffered_len(), 1);
    }

    #[test]
    fn invalid_header_len_is_rejected() {
        assert!(FramerConfig::new(37, 52, 10, false, true, 4096).is_err());
    }

    #[test]
    fn buffer_cap_truncates_unbounded_garbage() {
        let mut framer = Framer::new(
            FramerConfig::new(36, 52, 10, false, true, 64).expect("valid config"),
        );
        let garbage = vec![0u8; 1000];
        let frames = framer.feed(&garbage);
        assert!(frames.is_empty());
        assert!(framer.buffered_len() <= 2 * 36);
    }
}
