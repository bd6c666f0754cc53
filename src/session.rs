//! Session orchestration.
//!
//! A session turns a [`SessionConfig`] into running workers:
//!
//! 1. Validate the configuration and build (or load) the protocol. Any error
//!    here aborts the session before hardware is touched.
//! 2. Persist the protocol artifact if enabled.
//! 3. Construct one measurement worker and one flow worker per configured
//!    channel, all logging under a shared session timestamp.
//! 4. Spawn every worker on its own task against a shared epoch and wait for
//!    all of them to reach a terminal state.
//!
//! A failing worker never cancels its siblings. Only the external stop signal
//! is broadcast to every worker.
//!
//! ## Files
//!
//! `<stamp>` is the start time plus a short session id, see [`session_stamp`].
//! Existing files are never overwritten.
//!
//! - `<data_dir>/<stamp>_resistance.csv`
//! - `<data_dir>/<stamp>_flow_node<N>.csv`
//! - `<protocol_dir>/<stamp>_protocol.json`

use crate::config::{MfcConfig, SessionConfig, SourceConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::{Actuatable, Measurable};
use crate::protocol::{
    build_protocol, load_protocol, persist_protocol, ChannelId, FlowChannel, GasLine, Protocol,
    ProtocolParams,
};
use crate::shutdown::ShutdownSignal;
use crate::worker::{
    FlowRole, FlowWorker, MeasurementRole, MeasurementWorker, WorkerReport, WorkerRole,
    WorkerStatus,
};
use chrono::{DateTime, Local};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// `strftime` pattern of the timestamp embedded in session file names.
pub const SESSION_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// File-name prefix shared by every file of one session.
///
/// The start time is followed by the first eight hex digits of the session id,
/// so sessions started within the same second never share a prefix.
pub fn session_stamp(started_at: &DateTime<Local>, session_id: Uuid) -> String {
    let id = session_id.simple().to_string();
    format!("{}_{}", started_at.format(SESSION_STAMP_FORMAT), &id[..8])
}

/// Creates the concrete devices a session drives.
///
/// Real instrument transports and the mock hardware both plug in here.
pub trait DeviceProvider {
    /// Measurement device.
    type Source: Measurable + 'static;
    /// Flow controller device.
    type Flow: Actuatable + 'static;

    /// Device for the `[source]` section.
    fn source_meter(&mut self, config: &SourceConfig) -> AppResult<Self::Source>;

    /// Device for one gas-line channel.
    fn flow_controller(
        &mut self,
        channel: &FlowChannel,
        config: &MfcConfig,
    ) -> AppResult<Self::Flow>;
}

/// Where the session's protocol comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolSource {
    /// Build from parameters.
    Build(ProtocolParams),
    /// Reload a saved artifact.
    Artifact(PathBuf),
}

impl ProtocolSource {
    /// Source selected by `config`: a saved artifact if one is named.
    pub fn from_config(config: &SessionConfig) -> Self {
        match &config.experiment.protocol_artifact {
            Some(path) => ProtocolSource::Artifact(path.clone()),
            None => ProtocolSource::Build(config.protocol.clone()),
        }
    }

    /// Produce the protocol for `gas_line`.
    ///
    /// An artifact must have been generated for exactly the configured nodes.
    pub fn load(&self, gas_line: &GasLine) -> AppResult<Protocol> {
        match self {
            ProtocolSource::Build(params) => build_protocol(params, gas_line),
            ProtocolSource::Artifact(path) => {
                let protocol = load_protocol(path)?;
                let expected: BTreeSet<ChannelId> = gas_line.channel_ids().collect();
                let found: BTreeSet<ChannelId> =
                    protocol.metadata().gas_line.channel_ids().collect();
                if expected != found {
                    return Err(DaqError::Configuration(format!(
                        "artifact {} was generated for nodes {:?}, configuration has {:?}",
                        path.display(),
                        found,
                        expected
                    )));
                }
                info!(path = %path.display(), "running saved protocol");
                Ok(protocol)
            }
        }
    }
}

/// Aggregate outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    /// Every worker stopped cleanly.
    Success,
    /// Some workers failed; the others' logs are complete.
    PartialFailure {
        /// Devices whose worker failed.
        failed: Vec<String>,
    },
    /// Every worker failed.
    Failure,
}

/// Result of [`run_session`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResult {
    /// Session identifier, also recorded in the artifact.
    pub session_id: Uuid,
    /// Wall-clock start.
    pub started_at: DateTime<Local>,
    /// Exposure vessel label from `[mfc]`.
    pub vessel: String,
    /// Persisted protocol artifact, if saved.
    pub protocol_path: Option<PathBuf>,
    /// Protocol length.
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    /// One report per worker, measurement worker first.
    pub workers: Vec<WorkerReport>,
}

impl SessionResult {
    /// Classify the worker outcomes.
    pub fn outcome(&self) -> SessionOutcome {
        let failed: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.is_failed())
            .map(|w| w.device_id.clone())
            .collect();
        if failed.is_empty() {
            SessionOutcome::Success
        } else if failed.len() == self.workers.len() {
            SessionOutcome::Failure
        } else {
            SessionOutcome::PartialFailure { failed }
        }
    }

    /// Report of the worker driving `device_id`.
    pub fn worker(&self, device_id: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.device_id == device_id)
    }

    /// Report of the flow worker on `node`.
    pub fn flow_worker(&self, node: u8) -> Option<&WorkerReport> {
        self.workers
            .iter()
            .find(|w| w.role == WorkerRole::Flow { channel: ChannelId(node) })
    }
}

/// Run one complete session.
///
/// Returns `Err` only for failures before any worker started (invalid
/// configuration, infeasible protocol, unwritable output directories). Worker
/// failures are reported in the [`SessionResult`].
pub async fn run_session<P: DeviceProvider>(
    config: &SessionConfig,
    provider: &mut P,
    shutdown: ShutdownSignal,
) -> AppResult<SessionResult> {
    let session_id = Uuid::new_v4();
    run(session_id, config, provider, shutdown)
        .instrument(info_span!("session", %session_id))
        .await
}

async fn run<P: DeviceProvider>(
    session_id: Uuid,
    config: &SessionConfig,
    provider: &mut P,
    shutdown: ShutdownSignal,
) -> AppResult<SessionResult> {
    config.validate()?;
    let gas_line = config.gas_line()?;
    let protocol = Arc::new(ProtocolSource::from_config(config).load(&gas_line)?);
    info!(summary = %protocol.summary(), "protocol ready");

    let data_dir = &config.experiment.data_dir;
    fs::create_dir_all(data_dir)?;
    let started_at = Local::now();
    let stamp = session_stamp(&started_at, session_id);

    let protocol_path = if config.experiment.save_protocol {
        let path = config.protocol_dir().join(format!("{}_protocol.json", stamp));
        persist_protocol(&protocol, &path, Some(session_id))?;
        Some(path)
    } else {
        None
    };

    // All devices are created before the first task is spawned.
    let run_for = protocol.total_duration() + config.experiment.post_protocol;
    let measurement = MeasurementWorker::new(
        provider.source_meter(&config.source)?,
        MeasurementRole::new(Some(run_for)),
        config.source_settings(),
        data_dir.join(format!("{}_resistance.csv", stamp)),
    );
    let mut flows = Vec::with_capacity(config.mfc.channels.len());
    for channel in &config.mfc.channels {
        let role = FlowRole::new(channel.id, Arc::clone(&protocol))
            .park_on_stop(config.mfc.park_on_stop);
        flows.push(FlowWorker::new(
            provider.flow_controller(channel, &config.mfc)?,
            role,
            config.flow_settings(),
            data_dir.join(format!("{}_flow_node{}.csv", stamp, channel.id.0)),
        ));
    }

    info!(
        workers = 1 + flows.len(),
        total_duration = ?protocol.total_duration(),
        data_dir = %data_dir.display(),
        vessel = %config.mfc.vessel,
        "starting workers"
    );
    let epoch = Instant::now();
    let mut identities = Vec::with_capacity(1 + flows.len());
    let mut tasks = Vec::with_capacity(1 + flows.len());

    identities.push(identity(
        measurement.device_id(),
        WorkerRole::Measurement,
        measurement.log_path(),
    ));
    tasks.push(tokio::spawn(measurement.run(epoch, shutdown.clone())));
    for (worker, channel) in flows.into_iter().zip(&config.mfc.channels) {
        identities.push(identity(
            worker.device_id(),
            WorkerRole::Flow { channel: channel.id },
            worker.log_path(),
        ));
        tasks.push(tokio::spawn(worker.run(epoch, shutdown.clone())));
    }

    let workers: Vec<WorkerReport> = join_all(tasks)
        .await
        .into_iter()
        .zip(identities)
        .map(|(joined, fallback)| match joined {
            Ok(report) => report,
            Err(err) => {
                error!(device = %fallback.device_id, error = %err, "worker task aborted");
                WorkerReport {
                    status: WorkerStatus::Failed(format!("worker task aborted: {}", err)),
                    ..fallback
                }
            }
        })
        .collect();

    let result = SessionResult {
        session_id,
        started_at,
        vessel: config.mfc.vessel.clone(),
        protocol_path,
        total_duration: protocol.total_duration(),
        workers,
    };
    match result.outcome() {
        SessionOutcome::Success => info!("session finished, all workers stopped"),
        SessionOutcome::PartialFailure { failed } => {
            warn!(?failed, "session finished with failed workers")
        }
        SessionOutcome::Failure => error!("session finished, every worker failed"),
    }
    Ok(result)
}

/// Placeholder report used if a worker task dies without reporting.
fn identity(device_id: &str, role: WorkerRole, log_path: &Path) -> WorkerReport {
    WorkerReport {
        device_id: device_id.to_string(),
        role,
        status: WorkerStatus::Idle,
        log_path: log_path.to_path_buf(),
        records_written: 0,
        transient_errors: 0,
        stop_reason: None,
    }
}
