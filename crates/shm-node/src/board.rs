//! The console command surface the node drives to configure and control board sampling.
//!
//! Grounded in `original_source/.../sockets.py`'s `SocketClient`: `info`, `configure`,
//! `start_sampling`, `stop_sampling`, `reset`, each a short-lived console connection.
//! Kept as a trait, per the design's own framing of `BoardControl` as an external
//! collaborator the core depends on rather than owns; [`crate::console`] supplies the
//! concrete TCP implementation.

use shm_protocol::ChannelMap;

/// A failure talking to the board's console port.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    /// The console connection failed to open, or was dropped mid-command.
    #[error("console connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The banner or response didn't match the expected console protocol shape.
    #[error("console protocol error: {0}")]
    Protocol(String),

    /// The board replied `[KO]` to a command.
    #[error("board rejected the command: {0}")]
    Rejected(String),

    /// The board's info response didn't describe a valid sensor configuration.
    #[error("invalid sensor config reported by board: {0}")]
    InvalidConfig(#[from] shm_errors::ProtocolError),
}

/// Result of a board console command.
pub type BoardResult<T> = Result<T, BoardError>;

/// Raw fields reported by the board's `1` (info) command. Timestamp unit, filtering and
/// header-only mode are locally configured rather than board-reported, so they aren't
/// part of this response; the caller merges this with [`shm_config::SensorContext`] to
/// build a [`shm_protocol::SensorConfig`].
#[derive(Debug, Clone)]
pub struct BoardInfo {
    /// Board-reported sensor identifier, checked against the configured UUID unless
    /// `SENSOR_ALLOW_UNREGISTERED` is set.
    pub uuid: String,
    /// Device MAC address, as reported (not yet normalized).
    pub mac: String,
    /// Sampling frequency, in Hz.
    pub frequency: u32,
    /// Default `nreports` per frame.
    pub nreports: u8,
    /// Channel map classifying each of the 8 raw channels.
    pub channels: ChannelMap,
    /// Header length in bytes (36, or 40 with CRC-32 enabled).
    pub header_len: usize,
    /// Report record length in bytes.
    pub report_len: usize,
}

/// The console command surface a [`crate::Node`] drives to configure and control
/// board-side sampling (§6.2's command table).
pub trait BoardControl: Send + Sync {
    /// Query the board for its discovered sensor parameters (console command `1`).
    fn info(&self) -> BoardResult<BoardInfo>;

    /// Configure the board's stream target (console command `C <host>:<port>`).
    fn configure(&self, sensor_host: &str, sensor_port: u16) -> BoardResult<()>;

    /// Start sampling (console command `2` or `2 1;tStamp=<ms>` when `header_only`).
    /// Returns the start timestamp, in milliseconds, sent with the command.
    fn start_sampling(&self, header_only: bool) -> BoardResult<u64>;

    /// Stop sampling (console command `3`).
    fn stop_sampling(&self) -> BoardResult<()>;

    /// Reset the board (console command `7 1`).
    fn reset(&self) -> BoardResult<()>;
}
