//! Sensor configuration: the immutable-once-set parameters every other component reads.

use shm_errors::ProtocolError;

/// Timestamp unit carried by header/report fields.
///
/// `Auto` snapshots to a concrete unit on the first header seen in a session (per the
/// design note in the gateway's spec): values above `10^14` are treated as microseconds,
/// otherwise milliseconds. Callers that want the "snapshot once" behaviour should resolve
/// `Auto` to a concrete unit after the first header and hold onto that, rather than
/// calling [`TsUnit::to_ms`] with `Auto` on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsUnit {
    /// Raw value is already milliseconds.
    Millis,
    /// Raw value is microseconds.
    Micros,
    /// Detect from magnitude: `raw > 10^14` implies microseconds.
    Auto,
}

impl TsUnit {
    const AUTO_THRESHOLD: u64 = 100_000_000_000_000;

    /// Parse from one of the configuration strings `"ms"`, `"us"`, `"auto"` (case
    /// insensitive); unrecognized values fall back to `Auto`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "ms" => Self::Millis,
            "us" => Self::Micros,
            _ => Self::Auto,
        }
    }

    /// Convert a raw timestamp value to milliseconds.
    #[must_use]
    pub fn to_ms(self, raw: u64) -> u64 {
        match self {
            Self::Millis => raw,
            Self::Micros => raw / 1000,
            Self::Auto => {
                if raw > Self::AUTO_THRESHOLD {
                    raw / 1000
                } else {
                    raw
                }
            }
        }
    }

    /// Convert a raw timestamp value to microseconds.
    #[must_use]
    pub fn to_us(self, raw: u64) -> u64 {
        match self {
            Self::Millis => raw.saturating_mul(1000),
            Self::Micros => raw,
            Self::Auto => {
                if raw > Self::AUTO_THRESHOLD {
                    raw
                } else {
                    raw.saturating_mul(1000)
                }
            }
        }
    }
}

/// Classification of a raw channel position per the channel-map digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    /// `'1'` — accelerometer channel, persisted by the Storer.
    Accelerometer,
    /// `'2'` — opaque to this core, routed but not persisted.
    Class2,
    /// `'3'` — opaque to this core, routed but not persisted.
    Class3,
    /// `'4'` — integrated-temperature channel, persisted alongside accelerometers.
    IntegratedTemperature,
    /// `'5'` — temperature channel, opaque to this core.
    Temperature,
}

impl ChannelClass {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            b'1' => Some(Self::Accelerometer),
            b'2' => Some(Self::Class2),
            b'3' => Some(Self::Class3),
            b'4' => Some(Self::IntegratedTemperature),
            b'5' => Some(Self::Temperature),
            _ => None,
        }
    }
}

/// An 8-character channel map: one digit (`1..=5`) per raw channel position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    digits: [u8; 8],
}

impl ChannelMap {
    /// Parse an 8-character channel map string, e.g. `"11140000"` is rejected (`0` is not
    /// a valid class digit); a valid example is `"11142222"`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let bytes = raw.as_bytes();
        if bytes.len() != 8 || !bytes.iter().all(|b| (b'1'..=b'5').contains(b)) {
            return Err(ProtocolError::invalid_channel_map(raw));
        }
        let mut digits = [0u8; 8];
        digits.copy_from_slice(bytes);
        Ok(Self { digits })
    }

    /// Classification of channel position `i` (`0..8`).
    #[must_use]
    pub fn classify(&self, i: usize) -> Option<ChannelClass> {
        self.digits.get(i).copied().and_then(ChannelClass::from_digit)
    }

    /// Number of channels classified as [`ChannelClass::Accelerometer`].
    #[must_use]
    pub fn accelerometer_count(&self) -> usize {
        (0..8)
            .filter(|&i| self.classify(i) == Some(ChannelClass::Accelerometer))
            .count()
    }
}

/// Immutable-once-set sensor parameters.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Unique sensor identifier (`SENSOR_UUID`).
    pub uuid: String,
    /// Device MAC address, normalized to 12 lowercase hex chars with no colons.
    pub mac: String,
    /// Sampling frequency in Hz.
    pub frequency: u32,
    /// Default `nreports` per frame when the header carries `0`.
    pub nreports_default: u8,
    /// Channel map classifying each of the 8 raw channels.
    pub channels: ChannelMap,
    /// Header length in bytes: 36, or 40 when header CRC-32 is enabled.
    pub header_len: usize,
    /// Report record length in bytes (52).
    pub report_len: usize,
    /// Timestamp unit configuration.
    pub ts_unit: TsUnit,
    /// Whether to persist filtered accelerometer outputs instead of raw channels.
    pub is_filtered: bool,
    /// Whether frames are header-only (no payload) by default.
    pub header_only_default: bool,
}

impl SensorConfig {
    /// Report record byte length.
    pub const DEFAULT_REPORT_LEN: usize = 52;

    /// Validate and construct a `SensorConfig`.
    pub fn new(
        uuid: impl Into<String>,
        mac: impl Into<String>,
        frequency: u32,
        nreports_default: u8,
        channels: ChannelMap,
        header_len: usize,
        ts_unit: TsUnit,
        is_filtered: bool,
        header_only_default: bool,
    ) -> Result<Self, ProtocolError> {
        let mac = normalize_mac(&mac.into());
        if mac.len() != 12 || !mac.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::invalid_channel_map(format!(
                "mac must be 12 hex chars, got {mac:?}"
            )));
        }
        if !(1..=10).contains(&nreports_default) {
            return Err(ProtocolError::invalid_channel_map(format!(
                "nreports_default must be in 1..=10, got {nreports_default}"
            )));
        }
        if header_len != 36 && header_len != 40 {
            return Err(ProtocolError::invalid_channel_map(format!(
                "header_len must be 36 or 40, got {header_len}"
            )));
        }
        Ok(Self {
            uuid: uuid.into(),
            mac,
            frequency,
            nreports_default,
            channels,
            header_len,
            report_len: Self::DEFAULT_REPORT_LEN,
            ts_unit,
            is_filtered,
            header_only_default,
        })
    }
}

/// Lowercase the MAC and strip `:`/`-` separators.
#[must_use]
pub fn normalize_mac(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase()
}
