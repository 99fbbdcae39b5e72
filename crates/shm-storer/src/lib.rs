//! Rotating binary accelerometer file writer.
//!
//! Persists [`Sample`]s as fixed 20-byte little-endian records
//! (`u32 delta_us, f32 ax, f32 ay, f32 az, f32 temp`) relative to a per-file epoch,
//! rotating on a timestamp gap, `u32` delta overflow, or accumulated size, and
//! publishing each file with an atomic `.part` → `.dat` rename. Grounded in
//! `original_source/.../storer.py`'s `save`/`__setup_output_stream`/`__close_file`,
//! expressed with the `BufWriter`/`create_dir_all` idiom from
//! `telemetry-recorder::TelemetryRecorder`.

#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use shm_errors::{StorerError, StorerResult};
use shm_protocol::report::Sample;
use tracing::info;

/// Bytes per persisted record: `u32 delta_us` + 4 × `f32`.
pub const RECORD_LEN: usize = 20;

const GAP_ROTATE_US: u64 = 2_000_000;
const MIN_VALID_TS_US: u64 = 10_000_000_000;
const MS_TO_US_THRESHOLD: u64 = 10_000_000_000_000;

/// Rotating binary writer for one sensor's accelerometer stream.
///
/// Not `Send`/`Sync`-shared by design: owned exclusively by the `PacketHandler` worker
/// thread that decodes samples, matching the original single-writer-per-sensor model.
#[derive(Debug)]
pub struct Storer {
    mac: String,
    frequency: u32,
    file_duration: Duration,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    output: Option<BufWriter<File>>,
    stream_bytes: usize,
    start_ts_us: Option<u64>,
    last_ts_us: Option<u64>,
    begin_ts_filename: Option<u64>,
}

impl Storer {
    /// Build a new storer. `mac` should already be normalized (lowercase, no
    /// separators) by the caller.
    #[must_use]
    pub fn new(mac: impl Into<String>, frequency: u32, file_duration: Duration, data_dir: PathBuf) -> Self {
        let temp_dir = data_dir.join(".temp");
        Self {
            mac: mac.into(),
            frequency,
            file_duration,
            data_dir,
            temp_dir,
            output: None,
            stream_bytes: 0,
            start_ts_us: None,
            last_ts_us: None,
            begin_ts_filename: None,
        }
    }

    /// Persist one sample, rotating files as needed. `sample.ts_us` is the absolute
    /// timestamp in the unit the caller normalized upstream; this storer still
    /// re-validates and re-normalizes it independently, matching the original's
    /// defense-in-depth timestamp handling.
    pub fn save(&mut self, sample: &Sample) -> StorerResult<()> {
        let ts_us = Self::normalize_timestamp(sample.ts_us)?;

        if let Some(last) = self.last_ts_us {
            if ts_us.saturating_sub(last) > GAP_ROTATE_US {
                self.close()?;
                self.start_ts_us = Some(ts_us);
            }
        }
        self.last_ts_us = Some(ts_us);

        if self.start_ts_us.is_none() {
            self.start_ts_us = Some(ts_us);
        }

        let mut delta_us = ts_us.saturating_sub(self.start_ts_us.unwrap_or(ts_us));
        if delta_us > u64::from(u32::MAX) {
            self.close()?;
            self.start_ts_us = Some(ts_us);
            delta_us = 0;
        }

        self.ensure_output_stream()?;

        #[allow(clippy::cast_possible_truncation)]
        let delta_u32 = delta_us as u32;

        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&delta_u32.to_le_bytes());
        record[4..8].copy_from_slice(&sample.ax.to_le_bytes());
        record[8..12].copy_from_slice(&sample.ay.to_le_bytes());
        record[12..16].copy_from_slice(&sample.az.to_le_bytes());
        record[16..20].copy_from_slice(&sample.temp.to_le_bytes());

        if let Some(output) = self.output.as_mut() {
            output.write_all(&record).map_err(StorerError::from)?;
            self.stream_bytes += RECORD_LEN;
        }

        let rotate_threshold =
            RECORD_LEN * self.frequency as usize * self.file_duration.as_secs() as usize;
        if rotate_threshold > 0 && self.stream_bytes >= rotate_threshold {
            self.close()?;
        }

        Ok(())
    }

    /// Flush, fsync, and atomically publish the current file (if any) from the temp
    /// directory to the data directory. A no-op if no file is currently open.
    pub fn close(&mut self) -> StorerResult<()> {
        let Some(mut output) = self.output.take() else {
            self.stream_bytes = 0;
            self.start_ts_us = None;
            return Ok(());
        };

        output.flush().map_err(StorerError::from)?;
        output.get_ref().sync_all().map_err(StorerError::from)?;
        drop(output);

        let begin = self.begin_ts_filename.unwrap_or(0);
        let end = self.last_ts_us.unwrap_or(begin);

        let tmp_name = format!("shm_{}_05_{}.part", self.mac, begin);
        let dst_name = format!("shm_{}_05_{}_{}.dat", self.mac, begin, end);

        fs::create_dir_all(&self.data_dir).map_err(StorerError::from)?;
        fs::rename(self.temp_dir.join(&tmp_name), self.data_dir.join(&dst_name))
            .map_err(StorerError::from)?;

        info!(file = %dst_name, "created accelerometer file");

        self.stream_bytes = 0;
        self.start_ts_us = None;
        self.begin_ts_filename = None;
        Ok(())
    }

    fn ensure_output_stream(&mut self) -> StorerResult<()> {
        if self.output.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.temp_dir).map_err(StorerError::from)?;

        let begin = self.start_ts_us.unwrap_or(0);
        self.begin_ts_filename = Some(begin);
        let tmp_name = format!("shm_{}_05_{}.part", self.mac, begin);
        let file = File::options()
            .create(true)
            .append(true)
            .open(self.temp_dir.join(&tmp_name))
            .map_err(StorerError::from)?;
        self.output = Some(BufWriter::new(file));
        Ok(())
    }

    fn normalize_timestamp(ts_raw: u64) -> StorerResult<u64> {
        if ts_raw < MIN_VALID_TS_US {
            return Err(StorerError::invalid_timestamp(ts_raw));
        }
        if ts_raw < MS_TO_US_THRESHOLD {
            Ok(ts_raw.saturating_mul(1000))
        } else {
            Ok(ts_raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample(ts_us: u64, ax: f32) -> Sample {
        Sample { ts_us, ax, ay: 0.0, az: 0.0, temp: 20.0 }
    }

    #[test]
    fn writes_records_and_rotates_on_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storer = Storer::new("aabbccddeeff", 200, Duration::from_secs(300), dir.path().to_path_buf());

        storer.save(&sample(10_000_000_000_000, 1.0)).expect("save");
        storer.save(&sample(10_000_000_005_000, 2.0)).expect("save");
        storer.close().expect("close");

        let mut entries: Vec<_> = fs::read_dir(dir.path()).expect("read_dir").flatten().collect();
        entries.retain(|e| e.path().extension().is_some_and(|ext| ext == "dat"));
        assert_eq!(entries.len(), 1);

        let mut bytes = Vec::new();
        File::open(entries[0].path()).expect("open").read_to_end(&mut bytes).expect("read");
        assert_eq!(bytes.len(), 2 * RECORD_LEN);
    }

    #[test]
    fn rejects_timestamps_before_2001() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storer = Storer::new("aabbccddeeff", 200, Duration::from_secs(300), dir.path().to_path_buf());
        assert!(storer.save(&sample(1000, 1.0)).is_err());
    }

    #[test]
    fn gap_over_two_seconds_rotates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storer = Storer::new("aabbccddeeff", 200, Duration::from_secs(300), dir.path().to_path_buf());

        storer.save(&sample(10_000_000_000_000, 1.0)).expect("save");
        storer.save(&sample(10_000_003_000_001, 2.0)).expect("save");
        storer.close().expect("close");

        let mut entries: Vec<_> = fs::read_dir(dir.path()).expect("read_dir").flatten().collect();
        entries.retain(|e| e.path().extension().is_some_and(|ext| ext == "dat"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn size_based_rotation_closes_without_explicit_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        // frequency * file_duration * RECORD_LEN = 2 * 1 * 20 = 40 bytes -> rotate after 2 records.
        let mut storer = Storer::new("aabbccddeeff", 2, Duration::from_secs(1), dir.path().to_path_buf());

        storer.save(&sample(10_000_000_000_000, 1.0)).expect("save");
        storer.save(&sample(10_000_000_001_000, 2.0)).expect("save");

        let mut entries: Vec<_> = fs::read_dir(dir.path()).expect("read_dir").flatten().collect();
        entries.retain(|e| e.path().extension().is_some_and(|ext| ext == "dat"));
        assert_eq!(entries.len(), 1);
    }
}
