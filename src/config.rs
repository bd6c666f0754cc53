//! Session configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `GAS_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use gas_daq::config::SessionConfig;
//!
//! let config = SessionConfig::load_from("config/gas_daq.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), gas_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::protocol::{FlowChannel, GasLine, ProtocolParams};
use crate::validation;
use crate::worker::WorkerSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GAS_DAQ_";

/// Top-level session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Output and artifact settings
    pub experiment: ExperimentConfig,
    /// Source meter
    pub source: SourceConfig,
    /// Mass-flow controllers and gas line
    pub mfc: MfcConfig,
    /// Protocol parameters
    pub protocol: ProtocolParams,
    /// Worker retry and failure bounds
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where a session writes its files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Directory for per-worker logs
    pub data_dir: PathBuf,
    /// Persist the protocol artifact at session start
    #[serde(default = "default_true")]
    pub save_protocol: bool,
    /// Directory for the protocol artifact (defaults to `data_dir`)
    #[serde(default)]
    pub protocol_dir: Option<PathBuf>,
    /// Run a saved artifact instead of building from `[protocol]`
    #[serde(default)]
    pub protocol_artifact: Option<PathBuf>,
    /// Extra measurement time after the protocol ends
    #[serde(default, with = "humantime_serde")]
    pub post_protocol: Duration,
    /// Maximum time log rows may sit unflushed
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Source meter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// VISA resource string
    pub address: String,
    /// Measurement integration time
    #[serde(default = "default_integration_time", with = "humantime_serde")]
    pub integration_time: Duration,
    /// Sourced bias in volts
    #[serde(default = "default_source_voltage")]
    pub source_voltage: f64,
    /// Time between samples
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
}

/// Mass-flow controller bus and gas line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfcConfig {
    /// Serial port of the controller bus
    pub port: String,
    /// One entry per controller node
    pub channels: Vec<FlowChannel>,
    /// Flow through the sensor chamber
    pub total_flow_sccm: f64,
    /// Analyte concentration of the source cylinder
    pub cylinder_ppm: f64,
    /// Free-form label of the exposure vessel
    #[serde(default)]
    pub vessel: String,
    /// Time between readbacks
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Command zero flow when a controller worker stops
    #[serde(default = "default_true")]
    pub park_on_stop: bool,
}

/// Connection and sampling failure bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Plain connect attempts before the hard reset
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Delay after the first failed connect
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
    /// Backoff growth factor
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Consecutive failed samples before a worker fails
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            backoff: default_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_integration_time() -> Duration {
    Duration::from_millis(20)
}

fn default_source_voltage() -> f64 {
    1.0
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_attempts() -> u32 {
    2
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn field_error(field: &str, message: &str) -> DaqError {
    DaqError::Configuration(format!("{}: {}", field, message))
}

impl SessionConfig {
    /// Load configuration from a TOML file and `GAS_DAQ_` environment variables
    ///
    /// Example override: `GAS_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render configuration: {}", e)))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        validation::is_not_empty(&self.application.name)
            .map_err(|e| field_error("application.name", e))?;
        validation::is_valid_log_level(&self.application.log_level)
            .map_err(|e| field_error("application.log_level", e))?;

        let data_dir = self.experiment.data_dir.to_string_lossy();
        validation::is_valid_path(&data_dir).map_err(|e| field_error("experiment.data_dir", e))?;
        if let Some(dir) = &self.experiment.protocol_dir {
            validation::is_valid_path(&dir.to_string_lossy())
                .map_err(|e| field_error("experiment.protocol_dir", e))?;
        }
        validation::is_positive_duration(self.experiment.flush_interval)
            .map_err(|e| field_error("experiment.flush_interval", e))?;

        validation::is_not_empty(&self.source.address)
            .map_err(|e| field_error("source.address", e))?;
        validation::is_positive_duration(self.source.sample_interval)
            .map_err(|e| field_error("source.sample_interval", e))?;
        validation::is_in_range(self.source.source_voltage, -210.0..=210.0)
            .map_err(|e| field_error("source.source_voltage", e))?;

        validation::is_not_empty(&self.mfc.port).map_err(|e| field_error("mfc.port", e))?;
        validation::is_positive_duration(self.mfc.sample_interval)
            .map_err(|e| field_error("mfc.sample_interval", e))?;
        if self.mfc.channels.is_empty() {
            return Err(field_error("mfc.channels", "at least one channel is required"));
        }
        let mut nodes = HashSet::new();
        for channel in &self.mfc.channels {
            if !nodes.insert(channel.id) {
                return Err(DaqError::Configuration(format!(
                    "mfc.channels: duplicate node {}",
                    channel.id.0
                )));
            }
        }
        self.gas_line()?;

        validation::is_positive(self.worker.backoff_multiplier)
            .map_err(|e| field_error("worker.backoff_multiplier", e))?;
        validation::is_in_range(self.worker.max_consecutive_failures, 1..=u32::MAX)
            .map_err(|e| field_error("worker.max_consecutive_failures", e))?;

        if self.experiment.protocol_artifact.is_none() {
            self.protocol.validate()?;
        }
        Ok(())
    }

    /// Gas line described by `[mfc]`
    pub fn gas_line(&self) -> AppResult<GasLine> {
        GasLine::new(
            self.mfc.channels.clone(),
            self.mfc.total_flow_sccm,
            self.mfc.cylinder_ppm,
        )
    }

    /// Connection retry policy shared by all workers
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.worker.connect_attempts,
            backoff_delay: self.worker.backoff,
            backoff_multiplier: self.worker.backoff_multiplier,
        }
    }

    fn worker_settings(&self, sample_interval: Duration) -> WorkerSettings {
        WorkerSettings {
            sample_interval,
            retry: self.retry_policy(),
            max_consecutive_failures: self.worker.max_consecutive_failures,
            flush_interval: self.experiment.flush_interval,
        }
    }

    /// Settings of the measurement worker
    pub fn source_settings(&self) -> WorkerSettings {
        self.worker_settings(self.source.sample_interval)
    }

    /// Settings of every flow worker
    pub fn flow_settings(&self) -> WorkerSettings {
        self.worker_settings(self.mfc.sample_interval)
    }

    /// Directory the protocol artifact goes to
    pub fn protocol_dir(&self) -> &Path {
        self.experiment
            .protocol_dir
            .as_deref()
            .unwrap_or(&self.experiment.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChannelId, ChannelRole, PpmRange, RampKind};
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "gas-daq"
log_level = "info"

[experiment]
data_dir = "data"
post_protocol = "5m"

[source]
address = "GPIB0::24::INSTR"
source_voltage = 0.5
sample_interval = "500ms"

[mfc]
port = "/dev/ttyUSB0"
total_flow_sccm = 200.0
cylinder_ppm = 1000.0
vessel = "chamber A"
channels = [
    { node = 7, role = "analyte", max_flow_sccm = 20.0 },
    { node = 8, role = "carrier", max_flow_sccm = 200.0 },
]

[protocol]
range = { kind = "ramp", start = 0.0, end = 20.0 }
speeds_ppm_per_min = [1.0, 2.0]
speed_repeat = 2
settle_time = "30m"
ramp_kind = "step"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.source.sample_interval, Duration::from_millis(500));
        assert_eq!(config.experiment.post_protocol, Duration::from_secs(300));
        assert!(config.experiment.save_protocol);
        assert!(config.mfc.park_on_stop);
        assert_eq!(config.mfc.channels[0].id, ChannelId(7));
        assert_eq!(config.mfc.channels[1].role, ChannelRole::Carrier);
        assert_eq!(
            config.protocol.range,
            PpmRange::Ramp {
                start: 0.0,
                end: 20.0
            }
        );
        assert_eq!(config.protocol.ramp_kind, RampKind::Step);
        assert_eq!(config.protocol.hold(), Duration::from_secs(1800));
        assert_eq!(config.protocol.protocol_repeat, 1);
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.protocol_dir(), Path::new("data"));
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.application.log_level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("application.log_level"));
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let mut config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.mfc.channels[1].id = ChannelId(7);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node 7"));
    }

    #[test]
    fn rejects_zero_sample_interval() {
        let mut config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        config.mfc.sample_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn levels_range_parses() {
        let text = SAMPLE.replace(
            r#"range = { kind = "ramp", start = 0.0, end = 20.0 }"#,
            r#"range = { kind = "levels", levels = [0.0, 5.0, 10.0] }"#,
        );
        let config = SessionConfig::from_toml_str(&text).unwrap();
        assert_eq!(
            config.protocol.range,
            PpmRange::Levels {
                levels: vec![0.0, 5.0, 10.0]
            }
        );
    }

    #[test]
    fn renders_back_to_equivalent_toml() {
        let config = SessionConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(SessionConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var("GAS_DAQ_APPLICATION__LOG_LEVEL", "debug");
        std::env::set_var("GAS_DAQ_MFC__TOTAL_FLOW_SCCM", "150");
        let result = SessionConfig::load_from(file.path());
        std::env::remove_var("GAS_DAQ_APPLICATION__LOG_LEVEL");
        std::env::remove_var("GAS_DAQ_MFC__TOTAL_FLOW_SCCM");

        let config = result.unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.mfc.total_flow_sccm, 150.0);
    }

    #[test]
    #[serial]
    fn missing_file_reports_missing_field() {
        let err = SessionConfig::load_from("/nonexistent/gas_daq.toml").unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }
}
