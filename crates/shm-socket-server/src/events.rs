//! Outbound notification contract from the socket layer to its owner.

use shm_errors::ConnectionError;

/// Receives data and fault notifications from a [`crate::SocketServer`].
///
/// Implementations must be cheap and non-blocking: both callbacks run on the
/// server's own accepter/reader threads. Offload anything slower to an internal
/// queue, matching the original's `on_data_received`/`on_error` callback contract.
pub trait SocketEvents: Send + Sync {
    /// Called on every non-empty read, with the receive-side timestamp in
    /// milliseconds (local wall-clock — no kernel timestamp capture).
    fn on_data_received(&self, data: &[u8], rx_ts_ms: u64);

    /// Called on every accept-timeout, read-timeout, peer-close or I/O fault. The
    /// error's `Display` text is the wire-visible message text callers match log
    /// lines against.
    fn on_error(&self, error: ConnectionError);
}
