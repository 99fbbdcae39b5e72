//! Outbound alarm notification contract.

/// Receives alarm notifications from an [`AlarmEngine`](crate::AlarmEngine).
///
/// Implementations may fail transiently (network, queue-full); the engine does not
/// retry or propagate sink errors, matching the original's fire-and-forget callback.
pub trait AlarmSink: Send + Sync {
    /// Called the instant an event is opened (STA/LTA pre-alarm plus an FFT trigger).
    fn publish_alert(&self, trigger_ts_ms: u64, status: i32, uuid: &str);

    /// Called when an open event reaches its close deadline. `payload_blob` is the
    /// base64 encoding of the concatenated sample byte-strings collected for the event.
    fn publish_alert_data(&self, trigger_ts_ms: u64, data_ts_ms: u64, payload_blob: &str, uuid: &str);
}
