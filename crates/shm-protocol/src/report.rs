//! 52-byte report record decode and channel-map routing into [`Sample`]s.

use shm_errors::ProtocolError;

use crate::config::{ChannelClass, ChannelMap, TsUnit};
use crate::header::HeaderMetrics;

/// Report record length in bytes: 8 (timestamp) + 32 (8 raw channels) + 12 (3 filtered
/// accelerometer outputs).
pub const REPORT_LEN: usize = 52;

/// A decoded 52-byte report record: one sample slot within a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportRecord {
    /// Raw absolute timestamp, unit per the session's [`TsUnit`].
    pub ts_abs_raw: u64,
    /// The 8 raw channel values, in wire order.
    pub raw_channels: [f32; 8],
    /// The 3 filtered accelerometer outputs (valid only when the board is
    /// configured to emit filtered data).
    pub filtered: [f32; 3],
}

impl ReportRecord {
    /// Decode one report record from exactly (or at least) [`REPORT_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < REPORT_LEN {
            return Err(ProtocolError::short_report(bytes.len(), REPORT_LEN));
        }

        let ts_abs_raw = u64::from_le_bytes(
            bytes[0..8]
                .try_into()
                .map_err(|_| ProtocolError::short_report(bytes.len(), REPORT_LEN))?,
        );

        let mut raw_channels = [0f32; 8];
        for (i, chunk) in bytes[8..40].chunks_exact(4).enumerate() {
            let arr: [u8; 4] = chunk
                .try_into()
                .map_err(|_| ProtocolError::short_report(bytes.len(), REPORT_LEN))?;
            raw_channels[i] = f32::from_le_bytes(arr);
        }

        let mut filtered = [0f32; 3];
        for (i, chunk) in bytes[40..52].chunks_exact(4).enumerate() {
            let arr: [u8; 4] = chunk
                .try_into()
                .map_err(|_| ProtocolError::short_report(bytes.len(), REPORT_LEN))?;
            filtered[i] = f32::from_le_bytes(arr);
        }

        Ok(Self {
            ts_abs_raw,
            raw_channels,
            filtered,
        })
    }

    /// Route this record's channels into a [`Sample`] using `channels` to pick out the
    /// accelerometer and integrated-temperature positions, falling back to the board's
    /// filtered accelerometer output when `is_filtered` is set and the map carries at
    /// least 3 accelerometer channels.
    #[must_use]
    pub fn to_sample(&self, channels: &ChannelMap, is_filtered: bool, ts_unit: TsUnit) -> Sample {
        let mut accel = [0f32; 3];
        let mut accel_count = 0usize;
        let mut temp = 0f32;

        for i in 0..8 {
            match channels.classify(i) {
                Some(ChannelClass::Accelerometer) if accel_count < 3 => {
                    accel[accel_count] = self.raw_channels[i];
                    accel_count += 1;
                }
                Some(ChannelClass::IntegratedTemperature) => {
                    temp = self.raw_channels[i];
                }
                _ => {}
            }
        }

        let (ax, ay, az) = if is_filtered && channels.accelerometer_count() >= 3 {
            (self.filtered[0], self.filtered[1], self.filtered[2])
        } else {
            (accel[0], accel[1], accel[2])
        };

        Sample {
            ts_us: ts_unit.to_us(self.ts_abs_raw),
            ax,
            ay,
            az,
            temp,
        }
    }

    /// Build the raw byte concatenation the alarm engine buffers into event data:
    /// accelerometer channel bytes (or the filtered output when the board/config prefer
    /// it) followed by integrated-temperature channel bytes, the header's six metrics,
    /// and this report's own absolute-timestamp bytes — `a + it + hMetrics + [hTstamp]`
    /// in wire order.
    #[must_use]
    pub fn alarm_payload_bytes(
        &self,
        channels: &ChannelMap,
        is_filtered: bool,
        header_metrics: &HeaderMetrics,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        if is_filtered && channels.accelerometer_count() >= 3 {
            for v in self.filtered {
                out.extend_from_slice(&v.to_le_bytes());
            }
        } else {
            for i in 0..8 {
                if channels.classify(i) == Some(ChannelClass::Accelerometer) {
                    out.extend_from_slice(&self.raw_channels[i].to_le_bytes());
                }
            }
        }

        for i in 0..8 {
            if channels.classify(i) == Some(ChannelClass::IntegratedTemperature) {
                out.extend_from_slice(&self.raw_channels[i].to_le_bytes());
            }
        }

        for v in header_metrics {
            out.extend_from_slice(&v.to_le_bytes());
        }

        out.extend_from_slice(&self.ts_abs_raw.to_le_bytes());
        out
    }
}

/// A single accelerometer+temperature sample, ready for the Storer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Absolute timestamp, in microseconds.
    pub ts_us: u64,
    /// X-axis acceleration.
    pub ax: f32,
    /// Y-axis acceleration.
    pub ay: f32,
    /// Z-axis acceleration.
    pub az: f32,
    /// Temperature reading.
    pub temp: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_report(ts: u64, raw: [f32; 8], filtered: [f32; 3]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(REPORT_LEN);
        bytes.extend_from_slice(&ts.to_le_bytes());
        for v in raw {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in filtered {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn decode_round_trips_fields() {
        let raw = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let filtered = [9.0, 10.0, 11.0];
        let bytes = encode_report(1_700_000_000, raw, filtered);
        let record = ReportRecord::decode(&bytes).expect("decode");
        assert_eq!(record.ts_abs_raw, 1_700_000_000);
        assert_eq!(record.raw_channels, raw);
        assert_eq!(record.filtered, filtered);
    }

    #[test]
    fn short_report_is_rejected() {
        let bytes = vec![0u8; 10];
        assert!(ReportRecord::decode(&bytes).is_err());
    }

    #[test]
    fn to_sample_uses_raw_channels_by_default() {
        let channels = ChannelMap::parse("11142222").expect("valid map");
        let raw = [1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0];
        let bytes = encode_report(1_700_000, raw, [100.0, 200.0, 300.0]);
        let record = ReportRecord::decode(&bytes).expect("decode");

        let sample = record.to_sample(&channels, false, TsUnit::Millis);
        assert_eq!((sample.ax, sample.ay, sample.az), (1.0, 2.0, 3.0));
        assert_eq!(sample.temp, 9.0);
        assert_eq!(sample.ts_us, 1_700_000_000);
    }

    #[test]
    fn to_sample_prefers_filtered_when_enabled() {
        let channels = ChannelMap::parse("11142222").expect("valid map");
        let raw = [1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0];
        let bytes = encode_report(1_700_000, raw, [100.0, 200.0, 300.0]);
        let record = ReportRecord::decode(&bytes).expect("decode");

        let sample = record.to_sample(&channels, true, TsUnit::Millis);
        assert_eq!((sample.ax, sample.ay, sample.az), (100.0, 200.0, 300.0));
    }

    #[test]
    fn to_sample_falls_back_when_fewer_than_three_accel_channels() {
        let channels = ChannelMap::parse("15542222").expect("valid map");
        let raw = [1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0];
        let bytes = encode_report(1_700_000, raw, [100.0, 200.0, 300.0]);
        let record = ReportRecord::decode(&bytes).expect("decode");

        let sample = record.to_sample(&channels, true, TsUnit::Millis);
        assert_eq!((sample.ax, sample.ay, sample.az), (1.0, 0.0, 0.0));
    }

    #[test]
    fn alarm_payload_bytes_concatenates_accel_temp_metrics_and_timestamp() {
        let channels = ChannelMap::parse("11142222").expect("valid map");
        let raw = [1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0];
        let bytes = encode_report(1_700_000, raw, [100.0, 200.0, 300.0]);
        let record = ReportRecord::decode(&bytes).expect("decode");
        let metrics: HeaderMetrics = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let payload = record.alarm_payload_bytes(&channels, false, &metrics);

        let mut expected = Vec::new();
        for v in [1.0f32, 2.0, 3.0] {
            expected.extend_from_slice(&v.to_le_bytes());
        }
        expected.extend_from_slice(&9.0f32.to_le_bytes());
        for v in metrics {
            expected.extend_from_slice(&v.to_le_bytes());
        }
        expected.extend_from_slice(&1_700_000u64.to_le_bytes());

        assert_eq!(payload, expected);
    }

    #[test]
    fn alarm_payload_bytes_prefers_filtered_accel_when_enabled() {
        let channels = ChannelMap::parse("11142222").expect("valid map");
        let raw = [1.0, 2.0, 3.0, 9.0, 5.0, 6.0, 7.0, 8.0];
        let bytes = encode_report(1_700_000, raw, [100.0, 200.0, 300.0]);
        let record = ReportRecord::decode(&bytes).expect("decode");
        let metrics: HeaderMetrics = [0.0; 6];

        let payload = record.alarm_payload_bytes(&channels, true, &metrics);

        let mut expected = Vec::new();
        for v in [100.0f32, 200.0, 300.0] {
            expected.extend_from_slice(&v.to_le_bytes());
        }
        expected.extend_from_slice(&9.0f32.to_le_bytes());
        for v in metrics {
            expected.extend_from_slice(&v.to_le_bytes());
        }
        expected.extend_from_slice(&1_700_000u64.to_le_bytes());

        assert_eq!(payload, expected);
    }
}
