//! `SensorContext` — the single environment-derived configuration bundle every other
//! component reads from, grounded in `config_loader.py`'s `init_environment`.

use std::path::PathBuf;
use std::time::Duration;

use shm_errors::GatewayError;
use shm_protocol::TsUnit;

use crate::env::{parse_bool_env, parse_env, parse_env_validated, parse_path_env, required_env};

const DEFAULT_BOARD_WDT_S: u64 = 15;
const DEFAULT_FILE_DURATION_S: u64 = 300;
const DEFAULT_PACKET_QUEUE_MAX: usize = 200;
const DEFAULT_PACKET_BUFFER_MAX: usize = 4 * 1024 * 1024;
const DEFAULT_RX_CHUNK: usize = 4096;
const DEFAULT_EVENT_PRE_MS: u64 = 30_000;
const DEFAULT_EVENT_POST_MS: u64 = 45_000;
const DEFAULT_TS_FUTURE_SLACK_MS: u64 = 2000;
const DEFAULT_BOARD_PORT: u16 = 1105;

/// Every `SENSOR_*`/`DATA_DIR`/`LOG_DIR`/`RUN_DIR`/`PACKET_*`/`EVENT_*` knob the gateway
/// recognizes, loaded once from the environment. Board-discovered fields (MAC,
/// frequency, channel map — queried via `BoardControl::info`) live in
/// [`shm_protocol::SensorConfig`] instead, since they aren't known until the console
/// handshake completes.
#[derive(Debug, Clone)]
pub struct SensorContext {
    /// Unique sensor identifier (`SENSOR_UUID`, required).
    pub uuid: String,
    /// Listener bind host (`SENSOR_HOST`, default `0.0.0.0`).
    pub host: String,
    /// Listener bind port (`SENSOR_PORT`, required).
    pub port: u16,
    /// Board console host (`SENSOR_BOARD_IP`, default `localhost`).
    pub board_ip: String,
    /// Board console port (`SENSOR_BOARD_PORT`, default 1105).
    pub board_port: u16,
    /// Board watchdog period; drives the accept/read/first-packet timeout defaults.
    pub board_wdt: Duration,
    /// Accept-watchdog timeout.
    pub accept_timeout: Duration,
    /// Read-watchdog timeout.
    pub read_timeout: Duration,
    /// First-packet one-shot watchdog timeout.
    pub first_packet_timeout: Duration,
    /// Whether the board streams header-only frames by default.
    pub header_only: bool,
    /// Whether the board emits filtered accelerometer outputs.
    pub data_filtered: bool,
    /// Whether header CRC-32 verification is enabled (40-byte headers).
    pub enable_header_crc32: bool,
    /// Strict mode: resync immediately on CRC mismatch rather than logging and
    /// continuing.
    pub header_crc_strict: bool,
    /// Timestamp unit configuration.
    pub ts_unit: TsUnit,
    /// Future-timestamp slack, in milliseconds.
    pub ts_future_slack_ms: u64,
    /// Backstep tolerance override, in milliseconds; `None` means "half the sample
    /// period", resolved once `frequency` is known.
    pub ts_backstep_tol_ms: Option<u64>,
    /// Whether timestamp sanity checking is enabled at all.
    pub ts_check_enabled: bool,
    /// Whether payload samples are dropped on a timestamp violation.
    pub ts_drop_on_violation: bool,
    /// Whether whole frames are dropped on a header timestamp violation.
    pub ts_header_drop_on_violation: bool,
    /// Storer file rotation duration.
    pub file_duration: Duration,
    /// Directory for finalized `.dat` files.
    pub data_dir: PathBuf,
    /// Directory for logs.
    pub log_dir: PathBuf,
    /// Directory for runtime/lock files.
    pub run_dir: PathBuf,
    /// Maximum queued packets before the Reader drops newest.
    pub packet_queue_max: usize,
    /// Framer buffer cap, in bytes.
    pub packet_buffer_max: usize,
    /// Socket read chunk size, in bytes.
    pub rx_chunk: usize,
    /// Pre-roll window before an alarm trigger, in milliseconds.
    pub event_pre_ms: u64,
    /// Event window after an alarm trigger, in milliseconds.
    pub event_post_ms: u64,
    /// Whether the supervisor thread is enabled.
    pub supervisor_enabled: bool,
    /// Whether the node auto-restarts after a timeout-driven reset.
    pub auto_restart_on_timeout: bool,
    /// Test-only: allow unregistered sensors to proceed without a UUID check.
    pub allow_unregistered: bool,
}

impl SensorContext {
    /// Load the full context from environment variables, applying the defaults and
    /// derived-timeout rules documented on each field.
    pub fn from_env() -> Result<Self, GatewayError> {
        let uuid = required_env("SENSOR_UUID")
            .ok_or_else(|| GatewayError::config("SENSOR_UUID is required"))?;
        let port = required_env("SENSOR_PORT")
            .ok_or_else(|| GatewayError::config("SENSOR_PORT is required"))?
            .parse::<u16>()
            .map_err(|_| GatewayError::config("SENSOR_PORT must be a valid port number"))?;

        let board_wdt_s = parse_env("SENSOR_BOARD_WDT", DEFAULT_BOARD_WDT_S);
        let board_wdt = Duration::from_secs(board_wdt_s);

        let accept_timeout = Duration::from_secs(parse_env(
            "SENSOR_ACCEPT_TIMEOUT",
            board_wdt_s + 5,
        ));
        let read_timeout = Duration::from_secs(parse_env(
            "SENSOR_READ_TIMEOUT",
            board_wdt_s.div_ceil(2).max(6),
        ));
        let first_packet_timeout = Duration::from_secs_f64(parse_env_validated(
            "SENSOR_FIRST_PACKET_TIMEOUT",
            (board_wdt_s as f64 / 2.0).max(6.0),
            |v: &f64| *v > 0.0,
        ));

        let ts_backstep_tol_ms = required_env("SENSOR_TS_BACKSTEP_TOL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0);

        Ok(Self {
            uuid,
            host: parse_env("SENSOR_HOST", "0.0.0.0".to_string()),
            port,
            board_ip: parse_env("SENSOR_BOARD_IP", "localhost".to_string()),
            board_port: parse_env("SENSOR_BOARD_PORT", DEFAULT_BOARD_PORT),
            board_wdt,
            accept_timeout,
            read_timeout,
            first_packet_timeout,
            header_only: parse_bool_env("SENSOR_HEADER_ONLY", false),
            data_filtered: parse_bool_env("SENSOR_DATA_FILTERED", false),
            enable_header_crc32: parse_bool_env("SENSOR_ENABLE_HEADER_CRC32", false),
            header_crc_strict: parse_bool_env("SENSOR_HEADER_CRC_STRICT", true),
            ts_unit: TsUnit::parse(&parse_env("SENSOR_TS_UNIT", "auto".to_string())),
            ts_future_slack_ms: parse_env("SENSOR_TS_FUTURE_SLACK_MS", DEFAULT_TS_FUTURE_SLACK_MS),
            ts_backstep_tol_ms,
            ts_check_enabled: parse_bool_env("SENSOR_TS_CHECK_ENABLED", true),
            ts_drop_on_violation: parse_bool_env("SENSOR_TS_DROP_ON_VIOLATION", false),
            ts_header_drop_on_violation: parse_bool_env("SENSOR_TS_HEADER_DROP_ON_VIOLATION", false),
            file_duration: Duration::from_secs(parse_env("SENSOR_FILE_DURATION", DEFAULT_FILE_DURATION_S)),
            data_dir: parse_path_env("DATA_DIR", "./data"),
            log_dir: parse_path_env("LOG_DIR", "./logs"),
            run_dir: parse_path_env("RUN_DIR", "./run"),
            packet_queue_max: parse_env("PACKET_QUEUE_MAX", DEFAULT_PACKET_QUEUE_MAX),
            packet_buffer_max: parse_env("PACKET_BUFFER_MAX", DEFAULT_PACKET_BUFFER_MAX),
            rx_chunk: parse_env("SENSOR_RX_CHUNK", DEFAULT_RX_CHUNK),
            event_pre_ms: parse_env("EVENT_PRE_MS", DEFAULT_EVENT_PRE_MS),
            event_post_ms: parse_env("EVENT_POST_MS", DEFAULT_EVENT_POST_MS),
            supervisor_enabled: parse_bool_env("SENSOR_SUPERVISOR_ENABLED", true),
            auto_restart_on_timeout: parse_bool_env("SENSOR_AUTO_RESTART_ON_TIMEOUT", true),
            allow_unregistered: parse_bool_env("SENSOR_ALLOW_UNREGISTERED", false),
        })
    }

    /// Resolve the effective backstep tolerance given the board's sampling frequency:
    /// the configured override, or half a sample period if unset.
    #[must_use]
    pub fn resolve_backstep_tol_ms(&self, frequency_hz: u32) -> u64 {
        self.ts_backstep_tol_ms.unwrap_or_else(|| {
            if frequency_hz == 0 {
                0
            } else {
                500 / u64::from(frequency_hz)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_sensor_env() {
        for key in [
            "SENSOR_UUID", "SENSOR_HOST", "SENSOR_PORT", "SENSOR_BOARD_IP", "SENSOR_BOARD_PORT",
            "SENSOR_BOARD_WDT", "SENSOR_ACCEPT_TIMEOUT", "SENSOR_READ_TIMEOUT",
            "SENSOR_FIRST_PACKET_TIMEOUT", "SENSOR_TS_BACKSTEP_TOL_MS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn from_env_requires_uuid_and_port() {
        let _guard = ENV_LOCK.lock().expect("lock poisoned");
        clear_sensor_env();
        assert!(SensorContext::from_env().is_err());
    }

    #[test]
    fn from_env_derives_timeouts_from_board_wdt() {
        let _guard = ENV_LOCK.lock().expect("lock poisoned");
        clear_sensor_env();
        std::env::set_var("SENSOR_UUID", "sensor-1");
        std::env::set_var("SENSOR_PORT", "9100");
        std::env::set_var("SENSOR_BOARD_WDT", "20");

        let ctx = SensorContext::from_env().expect("valid context");
        assert_eq!(ctx.accept_timeout, Duration::from_secs(25));
        assert_eq!(ctx.read_timeout, Duration::from_secs(10));
        clear_sensor_env();
    }

    #[test]
    fn resolve_backstep_tol_falls_back_to_half_sample_period() {
        let _guard = ENV_LOCK.lock().expect("lock poisoned");
        clear_sensor_env();
        std::env::set_var("SENSOR_UUID", "sensor-1");
        std::env::set_var("SENSOR_PORT", "9100");

        let ctx = SensorContext::from_env().expect("valid context");
        assert_eq!(ctx.resolve_backstep_tol_ms(200), 2);
        clear_sensor_env();
    }
}
