//! CLI entry point for gas-daq
//!
//! Provides command-line access to:
//! - Building and saving a protocol without touching hardware
//! - Running a full session against mock devices
//! - Checking a configuration file
//!
//! # Usage
//!
//! ```bash
//! gas-daq protocol --config config/gas_daq.toml --out protocol.json
//! gas-daq simulate --config config/gas_daq.toml
//! gas-daq check --config config/gas_daq.toml
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use gas_daq::config::SessionConfig;
use gas_daq::hardware::mock::MockDeviceProvider;
use gas_daq::protocol::persist_protocol;
use gas_daq::session::{run_session, session_stamp, ProtocolSource, SessionOutcome};
use gas_daq::shutdown;
use gas_daq::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gas-daq")]
#[command(about = "Gas-sensing DAQ harness", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the protocol and save it as an artifact
    Protocol {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,

        /// Artifact path (defaults to the configured protocol directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a complete session against mock devices
    Simulate {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,
    },

    /// Validate a configuration and print it with defaults filled in
    Check {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Protocol { config, out } => {
            let config = load(&config, cli.log_format)?;
            save_protocol(&config, out)
        }
        Commands::Simulate { config } => {
            let config = load(&config, cli.log_format)?;
            simulate(&config).await
        }
        Commands::Check { config } => check(&config),
    }
}

fn load(path: &Path, format: OutputFormat) -> Result<SessionConfig> {
    let config = SessionConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let tracing = TracingConfig::from_session_config(&config)?.with_format(format);
    tracing_init::init(tracing)?;
    Ok(config)
}

fn save_protocol(config: &SessionConfig, out: Option<PathBuf>) -> Result<()> {
    config.validate()?;
    let gas_line = config.gas_line()?;
    let protocol = ProtocolSource::from_config(config).load(&gas_line)?;

    let path = out.unwrap_or_else(|| {
        let stamp = session_stamp(&Local::now(), Uuid::new_v4());
        config.protocol_dir().join(format!("{}_protocol.json", stamp))
    });
    persist_protocol(&protocol, &path, None)?;

    println!("{}", protocol.summary());
    println!("saved to {}", path.display());
    Ok(())
}

async fn simulate(config: &SessionConfig) -> Result<()> {
    let (handle, signal) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping workers");
            handle.trigger();
        }
    });

    let mut provider = MockDeviceProvider::new();
    let result = run_session(config, &mut provider, signal).await?;
    info!(session_id = %result.session_id, "session complete");
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result.outcome() {
        SessionOutcome::Success => Ok(()),
        SessionOutcome::PartialFailure { failed } => {
            bail!("workers failed: {}", failed.join(", "))
        }
        SessionOutcome::Failure => bail!("every worker failed"),
    }
}

fn check(path: &Path) -> Result<()> {
    let config = SessionConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    config.gas_line()?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
