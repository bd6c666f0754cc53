//! Device workers.
//!
//! A [`DeviceWorker`] owns one device, its connection handle and its log for
//! the whole session. It is generic over the device and over a [`SampleRole`],
//! which decides what one tick does: [`MeasurementRole`] reads a scalar,
//! [`FlowRole`] walks the protocol and writes setpoints before reading back.
//!
//! # State Machine
//!
//! ```text
//! Idle ──> Connecting ──> Running ──> Stopping ──> Stopped
//!   │          │  │          │           │
//!   │          │  └──stop────┼──────────>│
//!   └──────────┴─────────────┴───────────┴──> Failed(reason)
//! ```
//!
//! `Stopped` and `Failed` are terminal. A worker that fails after connecting
//! still passes through `Stopping`, so disconnect and log close are always
//! attempted.

pub mod flow;
pub mod measurement;

pub use flow::FlowRole;
pub use measurement::MeasurementRole;

use crate::data::{CsvLog, LogRecord};
use crate::error::TransportError;
use crate::error_recovery::{connect_with_recovery, RecoveryError, RetryPolicy};
use crate::hardware::Connectable;
use crate::protocol::ChannelId;
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    /// Constructed, not started.
    Idle,
    /// Opening the device connection.
    Connecting,
    /// Sampling.
    Running,
    /// Disconnecting and flushing.
    Stopping,
    /// Finished cleanly.
    Stopped,
    /// Finished with an error.
    Failed(String),
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "Idle"),
            WorkerStatus::Connecting => write!(f, "Connecting"),
            WorkerStatus::Running => write!(f, "Running"),
            WorkerStatus::Stopping => write!(f, "Stopping"),
            WorkerStatus::Stopped => write!(f, "Stopped"),
            WorkerStatus::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl WorkerStatus {
    /// `Stopped` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Stopped | WorkerStatus::Failed(_))
    }

    /// Check if moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Failed(_))
                | (Connecting, Running)
                | (Connecting, Stopping)
                | (Connecting, Failed(_))
                | (Running, Stopping)
                | (Running, Failed(_))
                | (Stopping, Stopped)
                | (Stopping, Failed(_))
        )
    }
}

/// What a worker does each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRole {
    /// Periodic scalar read.
    Measurement,
    /// Scheduled setpoint writes plus readback on one channel.
    Flow {
        /// Channel driven.
        channel: ChannelId,
    },
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Measurement => write!(f, "measurement"),
            WorkerRole::Flow { channel } => write!(f, "flow {}", channel),
        }
    }
}

/// Why the sample loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// Coordinated stop signal.
    External,
    /// The role's schedule ran out.
    ScheduleComplete,
    /// Unrecoverable error.
    Fatal(String),
}

/// Cadence and error bounds of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Time between ticks.
    pub sample_interval: Duration,
    /// Connection retry policy.
    pub retry: RetryPolicy,
    /// Consecutive failed ticks before the worker fails.
    pub max_consecutive_failures: u32,
    /// Maximum time rows may sit unflushed.
    pub flush_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            max_consecutive_failures: 5,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// A sample to append to the log.
    Sampled(LogRecord),
    /// Nothing left to do; stop the worker.
    Complete,
}

/// Per-tick behaviour of a worker.
#[async_trait]
pub trait SampleRole<D: Connectable>: Send {
    /// Role reported in status and results.
    fn role(&self) -> WorkerRole;

    /// CSV header of the role's log.
    fn header(&self) -> &'static [&'static str];

    /// Perform one sample. `elapsed` is measured from the session epoch.
    ///
    /// An error counts as one transient failure; the tick is skipped.
    async fn tick(
        &mut self,
        device: &mut D,
        handle: &mut D::Handle,
        elapsed: Duration,
    ) -> Result<Tick, TransportError>;

    /// Best-effort cleanup before disconnect.
    async fn on_stop(&mut self, _device: &mut D, _handle: &mut D::Handle) {}
}

/// Terminal outcome of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    /// Device identifier.
    pub device_id: String,
    /// Role the worker played.
    pub role: WorkerRole,
    /// `Stopped` or `Failed`.
    pub status: WorkerStatus,
    /// Log location.
    pub log_path: PathBuf,
    /// Rows appended, excluding the header.
    pub records_written: u64,
    /// Failed ticks that were skipped.
    pub transient_errors: u64,
    /// Why sampling ended; `None` if it never started.
    pub stop_reason: Option<StopReason>,
}

impl WorkerReport {
    /// Whether the worker ended in `Failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, WorkerStatus::Failed(_))
    }
}

/// Worker reading a scalar measurement.
pub type MeasurementWorker<D> = DeviceWorker<D, MeasurementRole>;

/// Worker driving one flow channel.
pub type FlowWorker<D> = DeviceWorker<D, FlowRole>;

/// One device, one task, one log.
pub struct DeviceWorker<D, R> {
    device: D,
    role: R,
    settings: WorkerSettings,
    log_path: PathBuf,
    status: watch::Sender<WorkerStatus>,
}

impl<D, R> DeviceWorker<D, R>
where
    D: Connectable,
    R: SampleRole<D>,
{
    /// Create an idle worker that will log to `log_path`.
    pub fn new(device: D, role: R, settings: WorkerSettings, log_path: impl Into<PathBuf>) -> Self {
        let (status, _) = watch::channel(WorkerStatus::Idle);
        Self {
            device,
            role,
            settings,
            log_path: log_path.into(),
            status,
        }
    }

    /// Device identifier.
    pub fn device_id(&self) -> &str {
        self.device.device_id()
    }

    /// Log location.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Current status.
    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change, usable after `run` consumed the worker.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    fn transition(&self, next: WorkerStatus) {
        let current = self.status();
        if !current.can_transition_to(&next) {
            error!(from = %current, to = %next, "illegal worker status transition ignored");
            return;
        }
        info!(status = %next, "worker status");
        self.status.send_replace(next);
    }

    /// Run the worker to a terminal state.
    ///
    /// `epoch` is the shared session start; protocol offsets are measured from it.
    #[instrument(name = "worker", skip_all, fields(device = %self.device.device_id(), role = %self.role.role()))]
    pub async fn run(mut self, epoch: Instant, mut shutdown: ShutdownSignal) -> WorkerReport {
        let mut report = WorkerReport {
            device_id: self.device.device_id().to_string(),
            role: self.role.role(),
            status: WorkerStatus::Idle,
            log_path: self.log_path.clone(),
            records_written: 0,
            transient_errors: 0,
            stop_reason: None,
        };

        let mut log = match CsvLog::create(
            &self.log_path,
            self.role.header(),
            self.settings.flush_interval,
        ) {
            Ok(log) => log,
            Err(err) => {
                error!(path = %self.log_path.display(), error = %err, "cannot open log");
                return self.finish(report, WorkerStatus::Failed(format!("cannot open log: {}", err)));
            }
        };

        self.transition(WorkerStatus::Connecting);
        let mut handle =
            match connect_with_recovery(&mut self.device, &self.settings.retry, &shutdown).await {
                Ok(handle) => handle,
                Err(RecoveryError::Cancelled) => {
                    self.transition(WorkerStatus::Stopping);
                    report.stop_reason = Some(StopReason::External);
                    let status = close_log(log, &mut report);
                    return self.finish(report, status);
                }
                Err(RecoveryError::Exhausted(err)) => {
                    error!(error = %err, "giving up on connection");
                    if let WorkerStatus::Failed(message) = close_log(log, &mut report) {
                        warn!(%message, "log not closed cleanly after failed connect");
                    }
                    return self.finish(report, WorkerStatus::Failed(err.to_string()));
                }
            };
        self.transition(WorkerStatus::Running);

        let mut ticker = interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let max_failures = self.settings.max_consecutive_failures.max(1);
        let mut consecutive: u32 = 0;

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break StopReason::External,
                _ = ticker.tick() => {}
            }

            match self
                .role
                .tick(&mut self.device, &mut handle, epoch.elapsed())
                .await
            {
                Ok(Tick::Sampled(record)) => {
                    consecutive = 0;
                    if let Err(err) = log.append(&record) {
                        error!(error = %err, "log write failed");
                        break StopReason::Fatal(format!("log write failed: {}", err));
                    }
                }
                Ok(Tick::Complete) => break StopReason::ScheduleComplete,
                Err(err) => {
                    consecutive += 1;
                    report.transient_errors += 1;
                    warn!(
                        attempt = consecutive,
                        max = max_failures,
                        error = %err,
                        "sample failed, skipping tick"
                    );
                    if consecutive >= max_failures {
                        break StopReason::Fatal(format!(
                            "{} consecutive sample failures, last: {}",
                            consecutive, err
                        ));
                    }
                }
            }
        };

        info!(reason = ?reason, "sampling ended");
        self.transition(WorkerStatus::Stopping);
        self.role.on_stop(&mut self.device, &mut handle).await;
        self.device.disconnect(handle).await;

        let closed = close_log(log, &mut report);
        let status = match &reason {
            StopReason::Fatal(message) => WorkerStatus::Failed(message.clone()),
            _ => closed,
        };
        report.stop_reason = Some(reason);
        self.finish(report, status)
    }

    fn finish(self, mut report: WorkerReport, status: WorkerStatus) -> WorkerReport {
        self.transition(status.clone());
        report.status = status;
        report
    }
}

/// Close `log`, recording its row count. Returns the status a clean stop should end in.
fn close_log(log: CsvLog, report: &mut WorkerReport) -> WorkerStatus {
    report.records_written = log.records();
    match log.close() {
        Ok(_) => WorkerStatus::Stopped,
        Err(err) => {
            error!(error = %err, "log close failed");
            WorkerStatus::Failed(format!("log close failed: {}", err))
        }
    }
}
