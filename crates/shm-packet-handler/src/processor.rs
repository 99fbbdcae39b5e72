//! The four-step per-frame pipeline: decode header, evaluate alarms, decode payload,
//! persist samples. Grounded in `packet.py`'s `__handle_one_frame`/`_parse_payload_content`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use shm_alarm::{AlarmEngine, AlarmSink};
use shm_framer::{Frame, Framer};
use shm_protocol::{ChannelMap, FrameHeader, ReportRecord, TsUnit, REPORT_LEN};
use shm_storer::Storer;
use tracing::{info, warn};

/// Immutable per-session settings the pipeline consults on every frame.
#[derive(Debug, Clone)]
pub struct FrameProcessorConfig {
    /// Sensor UUID, forwarded to the alarm sink.
    pub uuid: String,
    /// Channel map classifying the 8 raw channels.
    pub channels: ChannelMap,
    /// `nreports` used when the header carries `0`.
    pub nreports_default: u8,
    /// Whether to prefer filtered accelerometer outputs over raw channels.
    pub is_filtered: bool,
    /// Header length in bytes (36 or 40).
    pub header_len: usize,
    /// Timestamp unit configuration.
    pub ts_unit: TsUnit,
    /// Whether frames are header-only by default (used only for a compatibility log).
    pub header_only_default: bool,
    /// Future-timestamp slack, in milliseconds, for both header and payload guards.
    pub ts_future_slack_ms: u64,
    /// Backstep tolerance, in milliseconds, for both header and payload guards.
    pub ts_backstep_tol_ms: u64,
    /// Whether payload timestamp sanity checking runs at all.
    pub ts_check_enabled: bool,
    /// Whether a payload timestamp violation drops the sample from storage.
    pub ts_drop_on_violation: bool,
    /// Whether a header timestamp violation drops the whole frame.
    pub ts_header_drop_on_violation: bool,
}

/// Owns one session's `Framer` → `FrameHeader` decode → `AlarmEngine` →
/// `ReportRecord`/`Sample` decode → `Storer` pipeline. Not `Send`-shared concurrently by
/// design: wrapped in a mutex by [`crate::PacketHandler`] so only the worker thread
/// touches it at a time.
pub struct FrameProcessor {
    config: FrameProcessorConfig,
    framer: Framer,
    alarm: AlarmEngine,
    storer: Storer,
    sink: Arc<dyn AlarmSink>,
    last_header_ts_ms: Option<u64>,
    last_adj_ts_ms: Option<u64>,
    last_saved_ts: Option<u64>,
}

impl FrameProcessor {
    /// Build a new processor from its constituent components.
    #[must_use]
    pub fn new(
        config: FrameProcessorConfig,
        framer: Framer,
        alarm: AlarmEngine,
        storer: Storer,
        sink: Arc<dyn AlarmSink>,
    ) -> Self {
        Self {
            config,
            framer,
            alarm,
            storer,
            sink,
            last_header_ts_ms: None,
            last_adj_ts_ms: None,
            last_saved_ts: None,
        }
    }

    /// Feed one chunk of newly received bytes through the pipeline, handling every
    /// complete frame the `Framer` extracts from it. Never panics: a malformed header or
    /// payload is logged and skipped, matching the original worker's per-frame
    /// try/except.
    pub fn feed(&mut self, data: &[u8]) {
        let frames = self.framer.feed(data);
        for frame in frames {
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let header = match FrameHeader::decode(frame.header_bytes(self.config.header_len)) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "failed to decode frame header");
                return;
            }
        };

        self.alarm.log_flag_transitions(header.stalta_flag, header.fft_flag);

        if !header.header_only && self.config.header_only_default {
            info!(
                nreports = header.nreports,
                header_only = header.header_only,
                payload_len = frame.payload_bytes(self.config.header_len).len(),
                "header parsed"
            );
        }

        let hdr_ts_ms = self.config.ts_unit.to_ms(header.tstamp_fft_raw);
        let guard_ok = self.guard_header_timestamp(hdr_ts_ms);
        if !guard_ok && self.config.ts_header_drop_on_violation {
            return;
        }

        if header.nreports != 0 && header.nreports != self.config.nreports_default {
            warn!(
                header = header.nreports,
                config = self.config.nreports_default,
                "number of reports differs from configuration"
            );
        }

        let now_ms = wall_clock_ms();
        self.alarm.evaluate(
            header.stalta_flag,
            header.fft_flag,
            header.chmax_pct,
            now_ms,
            &self.config.uuid,
            self.sink.as_ref(),
        );

        if !header.header_only {
            self.parse_payload_content(frame, &header, now_ms);
        }
    }

    fn guard_header_timestamp(&mut self, ts_ms: u64) -> bool {
        let now_ms = wall_clock_ms();
        let mut ok = true;

        if ts_ms > now_ms.saturating_add(self.config.ts_future_slack_ms) {
            warn!(
                ts_ms,
                now_ms,
                delta_ms = ts_ms.saturating_sub(now_ms),
                "header timestamp too far in the future"
            );
            ok = false;
        }

        if let Some(last) = self.last_header_ts_ms {
            let back = last.saturating_sub(ts_ms);
            if back > self.config.ts_backstep_tol_ms {
                warn!(ts_ms, prev = last, back_ms = back, "header timestamp regressed");
                ok = false;
            }
        }

        self.last_header_ts_ms = Some(self.last_header_ts_ms.map_or(ts_ms, |prev| prev.max(ts_ms)));
        ok
    }

    fn ts_check(&mut self, adj_ts_ms: u64) -> bool {
        if !self.config.ts_check_enabled {
            return true;
        }

        let now_ms = wall_clock_ms();

        if adj_ts_ms > now_ms.saturating_add(self.config.ts_future_slack_ms) {
            warn!(
                adj_ts_ms,
                now_ms,
                drift_ms = adj_ts_ms.saturating_sub(now_ms),
                slack_ms = self.config.ts_future_slack_ms,
                "timestamp future drift"
            );
            if self.config.ts_drop_on_violation {
                return false;
            }
        }

        if let Some(last) = self.last_adj_ts_ms {
            let back = last.saturating_sub(adj_ts_ms);
            if back > self.config.ts_backstep_tol_ms {
                warn!(
                    adj_ts_ms,
                    last_ms = last,
                    back_ms = back,
                    tol_ms = self.config.ts_backstep_tol_ms,
                    "timestamp backstep"
                );
                if self.config.ts_drop_on_violation {
                    return false;
                }
            }
        }

        self.last_adj_ts_ms = Some(adj_ts_ms);
        true
    }

    fn parse_payload_content(&mut self, frame: &Frame, header: &FrameHeader, now_ms: u64) {
        let nreports = if header.nreports > 0 { header.nreports } else { self.config.nreports_default };
        let expected = usize::from(nreports) * REPORT_LEN;
        let payload = frame.payload_bytes(self.config.header_len);

        let payload = if payload.len() != expected {
            warn!(got = payload.len(), expected, nreports, "payload length mismatch");
            if payload.len() < expected {
                return;
            }
            &payload[..expected]
        } else {
            payload
        };

        for chunk in payload.chunks_exact(REPORT_LEN) {
            let record = match ReportRecord::decode(chunk) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "failed to decode report record");
                    continue;
                }
            };

            let sample = record.to_sample(&self.config.channels, self.config.is_filtered, self.config.ts_unit);
            let adj_ts_ms = sample.ts_us / 1000;
            let alarm_payload =
                record.alarm_payload_bytes(&self.config.channels, self.config.is_filtered, &header.metrics);

            let ts_ok = self.ts_check(adj_ts_ms);
            if !ts_ok && self.config.ts_drop_on_violation {
                warn!(adj_ts_ms, "timestamp sanity check failed — dropping sample");
                self.alarm.observe_sample(adj_ts_ms, alarm_payload, now_ms, &self.config.uuid, self.sink.as_ref());
                continue;
            }
            if !ts_ok {
                warn!(adj_ts_ms, "timestamp sanity check failed — keeping due to config");
            }

            if self.config.channels.accelerometer_count() > 0 {
                let backstepped = self.last_saved_ts.is_some_and(|last| adj_ts_ms < last);
                if backstepped {
                    warn!(adj_ts_ms, last_saved_ms = ?self.last_saved_ts, "skip save due to timestamp backstep");
                } else if let Err(err) = self.storer.save(&sample) {
                    warn!(error = %err, adj_ts_ms, "failed to save sample");
                } else {
                    self.last_saved_ts = Some(adj_ts_ms);
                }
            }

            self.alarm.observe_sample(adj_ts_ms, alarm_payload, now_ms, &self.config.uuid, self.sink.as_ref());
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
