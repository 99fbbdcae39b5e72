//! Lifecycle status publishing, consumed by the node on every state transition.

/// Sink for the node's lifecycle status publishes, grounded in `node.py`'s
/// `__send_status` (`{procStatus, message, uuid}` posted via `Request.update_sensor_status`).
///
/// Implementations must be cheap and non-blocking: `publish` runs inline on whichever
/// thread drives the transition (`start`/`stop`/`restart`, or the supervisor). Offload
/// anything slower to an internal queue.
pub trait StatusSink: Send + Sync {
    /// Publish a lifecycle status. `status` follows §6.4: `1` = Starting, `2` =
    /// Stopped/Restarting, `3` = Sampling/Running.
    fn publish(&self, status: i32, message: &str, uuid: &str);
}

/// A [`StatusSink`] that discards every publish. Useful in tests and as a default when
/// no status backend is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn publish(&self, _status: i32, _message: &str, _uuid: &str) {}
}
