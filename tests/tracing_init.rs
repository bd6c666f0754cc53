//! Global subscriber installation.
//!
//! Kept in its own test binary: installing the process-wide subscriber inside
//! the library's unit tests would swallow the events `traced_test` captures.

use gas_daq::tracing_init::{init, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn init_twice_is_harmless() {
    assert!(init(TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact)).is_ok());
    assert!(init(TracingConfig::new(Level::ERROR)).is_ok());
}
