//! Data storage.
pub mod csv_log;

pub use csv_log::{CsvLog, LogRecord, FLOW_HEADER, MEASUREMENT_HEADER};
