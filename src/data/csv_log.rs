//! Append-only per-worker CSV logs.
//!
//! Each worker owns one [`CsvLog`]: a header row, then one row per successful
//! sample. Rows are never rewritten. The log is flushed on a time interval and
//! closed exactly once by consuming it.

use crate::error::AppResult;
use crate::protocol::{ChannelId, Flow};
use chrono::{DateTime, Local, SecondsFormat};
use csv::Writer;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Header of a measurement log.
pub const MEASUREMENT_HEADER: [&str; 2] = ["timestamp", "value"];

/// Header of a flow log.
pub const FLOW_HEADER: [&str; 4] = ["timestamp", "channel", "setpoint", "readback"];

/// One sample, as written to a log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Scalar reading of a measurement device.
    Measurement {
        /// Wall-clock time of the read.
        timestamp: DateTime<Local>,
        /// Device the value came from.
        device_id: String,
        /// Measured value.
        value: f64,
    },
    /// Setpoint and readback of one flow channel.
    Flow {
        /// Wall-clock time of the readback.
        timestamp: DateTime<Local>,
        /// Channel sampled.
        channel: ChannelId,
        /// Last commanded setpoint.
        setpoint: Flow,
        /// Measured flow.
        readback: Flow,
    },
}

impl LogRecord {
    /// CSV fields in header order.
    pub fn to_row(&self) -> Vec<String> {
        match self {
            LogRecord::Measurement {
                timestamp, value, ..
            } => vec![iso_timestamp(timestamp), value.to_string()],
            LogRecord::Flow {
                timestamp,
                channel,
                setpoint,
                readback,
            } => vec![
                iso_timestamp(timestamp),
                channel.0.to_string(),
                format!("{:.3}", setpoint),
                format!("{:.3}", readback),
            ],
        }
    }
}

/// ISO-8601 with milliseconds and local offset.
pub fn iso_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// An open append-only CSV log.
pub struct CsvLog {
    path: PathBuf,
    writer: Writer<File>,
    records: u64,
    flush_interval: Duration,
    last_flush: Instant,
}

impl std::fmt::Debug for CsvLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvLog")
            .field("path", &self.path)
            .field("records", &self.records)
            .finish()
    }
}

impl CsvLog {
    /// Create a new log at `path` and write `header`.
    ///
    /// An existing regular file is never truncated. Device nodes such as
    /// `/dev/null` are opened in place. The header reaches disk with the
    /// first flush.
    pub fn create(path: &Path, header: &[&str], flush_interval: Duration) -> AppResult<Self> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && !path.is_file() => {
                OpenOptions::new().write(true).open(path)?
            }
            Err(err) => return Err(err.into()),
        };
        let mut writer = Writer::from_writer(file);
        writer.write_record(header)?;
        debug!(path = %path.display(), "log opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            records: 0,
            flush_interval,
            last_flush: Instant::now(),
        })
    }

    /// Append one record, flushing if the interval has elapsed.
    pub fn append(&mut self, record: &LogRecord) -> AppResult<()> {
        self.writer.write_record(record.to_row())?;
        self.records += 1;
        if self.last_flush.elapsed() >= self.flush_interval {
            self.writer.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Rows written so far, excluding the header.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and close.
    pub fn close(mut self) -> AppResult<u64> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), records = self.records, "log closed");
        Ok(self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(ms: i64) -> DateTime<Local> {
        Local.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn flow_row_formats_flows_with_three_decimals() {
        let record = LogRecord::Flow {
            timestamp: at(0),
            channel: ChannelId(8),
            setpoint: 190.0,
            readback: 189.98765,
        };
        let row = record.to_row();
        assert_eq!(&row[1..], ["8", "190.000", "189.988"]);
        assert!(row[0].contains('T'));
        assert!(row[0].contains(".000"));
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resistance.csv");
        let mut log = CsvLog::create(&path, &MEASUREMENT_HEADER, Duration::ZERO).unwrap();
        for i in 0..3 {
            log.append(&LogRecord::Measurement {
                timestamp: at(i * 100),
                device_id: "smu".into(),
                value: 1.0e6 + i as f64,
            })
            .unwrap();
        }
        assert_eq!(log.close().unwrap(), 3);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(header, MEASUREMENT_HEADER);
        let values: Vec<f64> = reader
            .records()
            .map(|r| r.unwrap()[1].parse().unwrap())
            .collect();
        assert_eq!(values, vec![1.0e6, 1.0e6 + 1.0, 1.0e6 + 2.0]);
    }

    #[test]
    fn existing_log_is_never_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resistance.csv");
        let mut log = CsvLog::create(&path, &MEASUREMENT_HEADER, Duration::ZERO).unwrap();
        log.append(&LogRecord::Measurement {
            timestamp: at(0),
            device_id: "smu".into(),
            value: 42.0,
        })
        .unwrap();
        log.close().unwrap();

        let err = CsvLog::create(&path, &FLOW_HEADER, Duration::ZERO).unwrap_err();
        assert!(matches!(err, crate::error::DaqError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        let rows = csv::Reader::from_path(&path).unwrap().records().count();
        assert_eq!(rows, 1);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("log.csv");
        let err = CsvLog::create(&path, &FLOW_HEADER, Duration::ZERO).unwrap_err();
        assert!(matches!(err, crate::error::DaqError::Io(_)));
    }
}
