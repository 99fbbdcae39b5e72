//! STA/LTA + FFT alarm state machine, event windows, and pre-roll history.
//!
//! Grounded in `original_source/.../packet.py`'s `_evaluate_alarms`,
//! `__log_alarm_flags` and `__handle_alarm_event`: a boolean pre-alarm state raised by
//! the STA/LTA flag, a trigger opened the instant the FFT flag rises while pre-alarm is
//! active, a 30-second stale-prealarm reset, and a rolling history buffer snapshotted
//! into each new event to cover its pre-roll window.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod sink;

pub use sink::AlarmSink;

use std::collections::VecDeque;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, info};

/// One decoded payload sample routed to the alarm engine: the sample's own absolute
/// timestamp plus the raw bytes the original concatenates into event buffers
/// (accelerometer/integrated-temperature channel bytes, the frame header's six metrics,
/// and the report's own absolute-timestamp bytes).
#[derive(Debug, Clone)]
pub struct SampleRecord {
    /// Absolute sample timestamp in milliseconds.
    pub ts_ms: u64,
    /// Concatenated raw bytes persisted into an alarm event's payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct OpenEvent {
    trigger_ts_ms: u64,
    last_alarm_ts_ms: u64,
    buffer: Option<Vec<SampleRecord>>,
    close_deadline_ms: u64,
}

/// Stateful STA/LTA + FFT alarm evaluator and event-window manager.
///
/// Not `Clone`: owned exclusively by the packet-handling worker thread, matching the
/// original's single-threaded `PacketHandler` alarm state.
#[derive(Debug)]
pub struct AlarmEngine {
    frequency: u32,
    event_post_ms: u64,
    alarm_state: bool,
    triggered: bool,
    alarm_state_ts_ms: Option<u64>,
    triggered_ts_ms: Option<u64>,
    open_events: Vec<OpenEvent>,
    history: VecDeque<SampleRecord>,
    flag_stalta: bool,
    flag_fft: bool,
}

impl AlarmEngine {
    /// Build a new engine. `frequency` sizes the pre-roll history ring buffer
    /// (`30 * frequency` samples, minimum 1); `event_post_ms` is the duration an open
    /// event stays collecting samples after its trigger.
    #[must_use]
    pub fn new(frequency: u32, event_post_ms: u64) -> Self {
        Self {
            frequency,
            event_post_ms,
            alarm_state: false,
            triggered: false,
            alarm_state_ts_ms: None,
            triggered_ts_ms: None,
            open_events: Vec::new(),
            history: VecDeque::new(),
            flag_stalta: false,
            flag_fft: false,
        }
    }

    /// Log STA/LTA and FFT flag transitions independently of the rest of the state
    /// machine — only on rising/falling edges, never once per frame.
    pub fn log_flag_transitions(&mut self, stalta_flag: bool, fft_flag: bool) {
        if stalta_flag && !self.flag_stalta {
            info!("alarm flag STALTA: raise");
        } else if !stalta_flag && self.flag_stalta {
            info!("alarm flag STALTA: clear");
        }
        self.flag_stalta = stalta_flag;

        if fft_flag && !self.flag_fft {
            info!("alarm flag FFT: raise");
        } else if !fft_flag && self.flag_fft {
            info!("alarm flag FFT: clear");
        }
        self.flag_fft = fft_flag;
    }

    /// Advance the state machine for one decoded header: raise/extend pre-alarm on
    /// STA/LTA, open an event on an FFT trigger while pre-alarm is active, reset a
    /// stale pre-alarm after 30s of inactivity, and sweep any events past their close
    /// deadline.
    pub fn evaluate(
        &mut self,
        stalta_flag: bool,
        fft_flag: bool,
        chmax_pct: u8,
        now_ms: u64,
        uuid: &str,
        sink: &dyn AlarmSink,
    ) {
        if stalta_flag {
            if !self.alarm_state {
                info!("STA/LTA flag entered pre-alarm state");
            }
            self.alarm_state = true;
            self.alarm_state_ts_ms = Some(now_ms);

            if let Some(trigger_ts) = self.triggered_ts_ms {
                for event in &mut self.open_events {
                    if event.trigger_ts_ms == trigger_ts {
                        event.last_alarm_ts_ms = now_ms;
                        break;
                    }
                }
            }
        }

        if self.alarm_state && !self.triggered && fft_flag {
            info!(channel = chmax_pct, "triggering alarm");
            self.triggered = true;
            self.triggered_ts_ms = Some(now_ms);
            self.open_events.push(OpenEvent {
                trigger_ts_ms: now_ms,
                last_alarm_ts_ms: self.alarm_state_ts_ms.unwrap_or(now_ms),
                buffer: None,
                close_deadline_ms: now_ms.saturating_add(self.event_post_ms),
            });
            sink.publish_alert(now_ms, 1, uuid);
        }

        if self.alarm_state && now_ms.saturating_sub(self.alarm_state_ts_ms.unwrap_or(now_ms)) > 30_000 {
            info!("resetting pre-alarm state");
            self.alarm_state = false;
            self.triggered = false;
            self.alarm_state_ts_ms = None;
            self.triggered_ts_ms = None;
        }

        self.sweep_closed_events(now_ms, uuid, sink);
    }

    /// Route one decoded payload sample to every open event (initializing its buffer
    /// with the pre-roll history on first touch) and append it to the history ring,
    /// trimmed to `30 * frequency` entries.
    pub fn observe_sample(&mut self, ts_ms: u64, payload: Vec<u8>, now_ms: u64, uuid: &str, sink: &dyn AlarmSink) {
        let record = SampleRecord { ts_ms, payload };

        if !self.open_events.is_empty() {
            for event in &mut self.open_events {
                if event.buffer.is_none() {
                    debug!("creating a new event data buffer");
                    event.buffer = Some(self.history.iter().cloned().collect());
                }
                if let Some(buffer) = event.buffer.as_mut() {
                    buffer.push(record.clone());
                }
            }
            self.sweep_closed_events(now_ms, uuid, sink);
        }

        let max_history = (30_u64.saturating_mul(u64::from(self.frequency))).max(1) as usize;
        self.history.push_back(record);
        while self.history.len() > max_history {
            self.history.pop_front();
        }
    }

    fn sweep_closed_events(&mut self, now_ms: u64, uuid: &str, sink: &dyn AlarmSink) {
        let mut remaining = Vec::with_capacity(self.open_events.len());
        for event in self.open_events.drain(..) {
            if now_ms >= event.close_deadline_ms {
                info!("sending triggered buffer to the alarm handler");
                let buffer = event.buffer.unwrap_or_default();
                let blob = encode_payload_blob(&buffer);
                sink.publish_alert_data(event.trigger_ts_ms, now_ms, &blob, uuid);
                debug!("removed event data from list");
            } else {
                remaining.push(event);
            }
        }
        self.open_events = remaining;

        if self.open_events.is_empty() {
            self.triggered = false;
            self.triggered_ts_ms = None;
        }
    }

    /// Number of currently open (not-yet-closed) alarm events.
    #[must_use]
    pub fn open_event_count(&self) -> usize {
        self.open_events.len()
    }

    /// Current pre-alarm state (`true` once STA/LTA has raised and not yet reset).
    #[must_use]
    pub fn is_in_prealarm(&self) -> bool {
        self.alarm_state
    }
}

fn encode_payload_blob(buffer: &[SampleRecord]) -> String {
    let mut concatenated = Vec::new();
    for record in buffer {
        concatenated.extend_from_slice(&record.payload);
    }
    BASE64.encode(concatenated)
}
