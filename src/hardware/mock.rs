//! Mock Hardware Implementations
//!
//! Simulated instruments for tests and for `gas-daq simulate`. All delays use
//! `tokio::time::sleep`, so tests can run on a paused clock.
//!
//! # Available Mocks
//!
//! - `MockSourceMeter` - biased resistance measurement with ~1% noise
//! - `MockFlowController` - one MFC node whose readback follows its setpoint
//! - `MockDeviceProvider` - hands out the above to a session
//!
//! # Fault injection
//!
//! Every mock takes a [`FaultPlan`] (failed connects, failing reset, transient
//! or permanent read failures, rejected writes) and records each call in a
//! shared [`CallJournal`] that tests inspect after the device has been moved
//! into a worker.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::config::{MfcConfig, SourceConfig};
use crate::error::{AppResult, TransportError, TransportErrorKind};
use crate::hardware::capabilities::{Actuatable, Connectable, Measurable};
use crate::protocol::{ChannelId, Flow, FlowChannel};
use crate::session::DeviceProvider;

// =============================================================================
// Fault plan and call journal
// =============================================================================

/// Failures a mock device injects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    /// The first `connect_failures` connects fail.
    pub connect_failures: u32,
    /// `reset()` fails.
    pub reset_fails: bool,
    /// Every read after this many read attempts fails.
    pub read_failures_after: Option<u64>,
    /// 1-based read attempts that fail once.
    pub transient_read_failures: Vec<u64>,
    /// Every setpoint write is rejected.
    pub reject_writes: bool,
    /// 1-based write attempts that are rejected once.
    pub transient_write_failures: Vec<u64>,
    /// Simulated transport latency per call.
    pub latency: Duration,
}

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `connect()`
    Connect { ok: bool },
    /// `reset()`
    Reset { ok: bool },
    /// `read_measurement()`
    Read { ok: bool },
    /// `set_flow_setpoint()`
    Write { channel: ChannelId, flow: Flow, ok: bool },
    /// `disconnect()`
    Disconnect,
}

/// Shared, append-only record of the calls a mock received.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl CallJournal {
    fn record(&self, call: MockCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    /// Flows of the accepted setpoint writes, in order.
    pub fn accepted_writes(&self) -> Vec<Flow> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Write { flow, ok: true, .. } => Some(flow),
                _ => None,
            })
            .collect()
    }
}

/// Connection handle returned by every mock.
#[derive(Debug)]
pub struct MockLink {
    /// Which successful connect produced this link (1-based).
    pub generation: u32,
}

/// Transport behaviour shared by the mocks.
#[derive(Debug)]
struct MockTransport {
    id: String,
    faults: FaultPlan,
    connect_attempts: u32,
    connections: u32,
    read_attempts: u64,
    journal: CallJournal,
}

impl MockTransport {
    fn new(id: String) -> Self {
        Self {
            id,
            faults: FaultPlan::default(),
            connect_attempts: 0,
            connections: 0,
            read_attempts: 0,
            journal: CallJournal::default(),
        }
    }

    fn error(&self, kind: TransportErrorKind, message: &str) -> TransportError {
        TransportError::new(self.id.clone(), kind, message)
    }

    async fn delay(&self) {
        if !self.faults.latency.is_zero() {
            sleep(self.faults.latency).await;
        }
    }

    async fn connect(&mut self) -> Result<MockLink, TransportError> {
        self.delay().await;
        self.connect_attempts += 1;
        let ok = self.connect_attempts > self.faults.connect_failures;
        self.journal.record(MockCall::Connect { ok });
        if !ok {
            return Err(self.error(TransportErrorKind::Unreachable, "resource busy"));
        }
        self.connections += 1;
        debug!(device = %self.id, generation = self.connections, "mock connected");
        Ok(MockLink {
            generation: self.connections,
        })
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.delay().await;
        let ok = !self.faults.reset_fails;
        self.journal.record(MockCall::Reset { ok });
        if ok {
            Ok(())
        } else {
            Err(self.error(TransportErrorKind::Timeout, "reset did not complete"))
        }
    }

    async fn read_gate(&mut self) -> Result<(), TransportError> {
        self.delay().await;
        self.read_attempts += 1;
        let attempt = self.read_attempts;
        let permanent = self
            .faults
            .read_failures_after
            .is_some_and(|after| attempt > after);
        let transient = self.faults.transient_read_failures.contains(&attempt);
        let ok = !(permanent || transient);
        self.journal.record(MockCall::Read { ok });
        if ok {
            Ok(())
        } else {
            Err(self.error(TransportErrorKind::Timeout, "no reply to measurement query"))
        }
    }

    fn disconnect(&mut self, link: MockLink) {
        debug!(device = %self.id, generation = link.generation, "mock disconnected");
        self.journal.record(MockCall::Disconnect);
    }
}

fn noise(fraction: f64) -> f64 {
    if fraction <= 0.0 {
        return 1.0;
    }
    1.0 + rand::thread_rng().gen_range(-fraction..fraction)
}

// =============================================================================
// MockSourceMeter - Simulated Source/Measure Unit
// =============================================================================

/// Mock source meter measuring sensor resistance.
///
/// Sources a fixed bias and returns a resistance around `base_ohms` with ~1%
/// noise. A zero bias is rejected on read, as a real SMU cannot resolve
/// resistance without current.
///
/// # Example
///
/// ```rust,ignore
/// let mut meter = MockSourceMeter::new("smu").with_base_ohms(2.0e6);
/// let mut link = meter.connect().await?;
/// let ohms = meter.read_measurement(&mut link).await?;
/// ```
#[derive(Debug)]
pub struct MockSourceMeter {
    transport: MockTransport,
    bias_volts: f64,
    base_ohms: f64,
    noise: f64,
    integration_time: Duration,
}

impl MockSourceMeter {
    /// Create a mock with 1 V bias reading ~1 MΩ.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            transport: MockTransport::new(device_id.into()),
            bias_volts: 1.0,
            base_ohms: 1.0e6,
            noise: 0.01,
            integration_time: Duration::ZERO,
        }
    }

    /// Mock configured from a source section.
    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(config.address.clone())
            .with_bias(config.source_voltage)
            .with_integration_time(config.integration_time)
    }

    /// Time each measurement takes before the reply arrives.
    pub fn with_integration_time(mut self, integration_time: Duration) -> Self {
        self.integration_time = integration_time;
        self
    }

    /// Inject faults.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.transport.faults = faults;
        self
    }

    /// Set the sourced bias in volts.
    pub fn with_bias(mut self, volts: f64) -> Self {
        self.bias_volts = volts;
        self
    }

    /// Set the nominal resistance in ohms.
    pub fn with_base_ohms(mut self, ohms: f64) -> Self {
        self.base_ohms = ohms;
        self
    }

    /// Handle onto the call journal.
    pub fn journal(&self) -> CallJournal {
        self.transport.journal.clone()
    }
}

#[async_trait]
impl Connectable for MockSourceMeter {
    type Handle = MockLink;

    fn device_id(&self) -> &str {
        &self.transport.id
    }

    async fn connect(&mut self) -> Result<MockLink, TransportError> {
        self.transport.connect().await
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.transport.reset().await
    }

    async fn disconnect(&mut self, handle: MockLink) {
        self.transport.disconnect(handle);
    }
}

#[async_trait]
impl Measurable for MockSourceMeter {
    async fn read_measurement(&mut self, _handle: &mut MockLink) -> Result<f64, TransportError> {
        if !self.integration_time.is_zero() {
            sleep(self.integration_time).await;
        }
        self.transport.read_gate().await?;
        if self.bias_volts == 0.0 {
            return Err(self
                .transport
                .error(TransportErrorKind::Rejected, "zero bias, no current to measure"));
        }
        Ok(self.base_ohms * noise(self.noise))
    }
}

// =============================================================================
// MockFlowController - Simulated MFC node
// =============================================================================

/// Mock mass-flow controller for one bus node.
///
/// Accepts setpoints in `[0, max_flow]` on its own channel; the readback is the
/// last accepted setpoint with ~0.5% noise.
#[derive(Debug)]
pub struct MockFlowController {
    transport: MockTransport,
    channel: ChannelId,
    max_flow: Flow,
    setpoint: Flow,
    write_attempts: u64,
    noise: f64,
}

impl MockFlowController {
    /// Create a mock node.
    pub fn new(channel: ChannelId, max_flow: Flow) -> Self {
        Self {
            transport: MockTransport::new(format!("mfc-{}", channel)),
            channel,
            max_flow,
            setpoint: 0.0,
            write_attempts: 0,
            noise: 0.005,
        }
    }

    /// Mock configured from a gas-line channel.
    pub fn from_channel(channel: &FlowChannel) -> Self {
        Self::new(channel.id, channel.max_flow_sccm)
    }

    /// Inject faults.
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.transport.faults = faults;
        self
    }

    /// Disable readback noise.
    pub fn exact(mut self) -> Self {
        self.noise = 0.0;
        self
    }

    /// Handle onto the call journal.
    pub fn journal(&self) -> CallJournal {
        self.transport.journal.clone()
    }
}

#[async_trait]
impl Connectable for MockFlowController {
    type Handle = MockLink;

    fn device_id(&self) -> &str {
        &self.transport.id
    }

    async fn connect(&mut self) -> Result<MockLink, TransportError> {
        self.transport.connect().await
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.transport.reset().await
    }

    async fn disconnect(&mut self, handle: MockLink) {
        self.transport.disconnect(handle);
    }
}

#[async_trait]
impl Measurable for MockFlowController {
    async fn read_measurement(&mut self, _handle: &mut MockLink) -> Result<f64, TransportError> {
        self.transport.read_gate().await?;
        Ok((self.setpoint * noise(self.noise)).max(0.0))
    }
}

#[async_trait]
impl Actuatable for MockFlowController {
    async fn set_flow_setpoint(
        &mut self,
        _handle: &mut MockLink,
        channel: ChannelId,
        flow: Flow,
    ) -> Result<(), TransportError> {
        self.transport.delay().await;
        self.write_attempts += 1;
        let faults = &self.transport.faults;
        let rejection = if faults.reject_writes
            || faults.transient_write_failures.contains(&self.write_attempts)
        {
            Some("setpoint write rejected".to_string())
        } else if channel != self.channel {
            Some(format!("addressed {} on {}", channel, self.channel))
        } else if !(0.0..=self.max_flow).contains(&flow) {
            Some(format!("{:.3} sccm outside [0, {:.3}]", flow, self.max_flow))
        } else {
            None
        };

        self.transport.journal.record(MockCall::Write {
            channel,
            flow,
            ok: rejection.is_none(),
        });
        match rejection {
            Some(message) => Err(self.transport.error(TransportErrorKind::Rejected, &message)),
            None => {
                self.setpoint = flow;
                Ok(())
            }
        }
    }
}

// =============================================================================
// MockDeviceProvider
// =============================================================================

/// Supplies mock devices to a session, with optional per-device faults.
#[derive(Debug, Default)]
pub struct MockDeviceProvider {
    source_faults: FaultPlan,
    flow_faults: HashMap<ChannelId, FaultPlan>,
    journals: HashMap<String, CallJournal>,
}

impl MockDeviceProvider {
    /// Provider with fault-free devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject faults into the source meter.
    pub fn with_source_faults(mut self, faults: FaultPlan) -> Self {
        self.source_faults = faults;
        self
    }

    /// Inject faults into the controller on `node`.
    pub fn with_flow_faults(mut self, node: u8, faults: FaultPlan) -> Self {
        self.flow_faults.insert(ChannelId(node), faults);
        self
    }

    /// Journal of a device handed out earlier.
    pub fn journal(&self, device_id: &str) -> Option<CallJournal> {
        self.journals.get(device_id).cloned()
    }
}

impl DeviceProvider for MockDeviceProvider {
    type Source = MockSourceMeter;
    type Flow = MockFlowController;

    fn source_meter(&mut self, config: &SourceConfig) -> AppResult<MockSourceMeter> {
        let meter = MockSourceMeter::from_config(config).with_faults(self.source_faults.clone());
        self.journals
            .insert(meter.device_id().to_string(), meter.journal());
        Ok(meter)
    }

    fn flow_controller(
        &mut self,
        channel: &FlowChannel,
        _config: &MfcConfig,
    ) -> AppResult<MockFlowController> {
        let faults = self.flow_faults.get(&channel.id).cloned().unwrap_or_default();
        let controller = MockFlowController::from_channel(channel).with_faults(faults);
        self.journals
            .insert(controller.device_id().to_string(), controller.journal());
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_meter_reads_near_base() {
        let mut meter = MockSourceMeter::new("smu").with_base_ohms(2.5e6);
        let mut link = meter.connect().await.unwrap();
        let reading = meter.read_measurement(&mut link).await.unwrap();
        assert!(
            reading > 2.47e6 && reading < 2.53e6,
            "Reading {} not in expected range",
            reading
        );
    }

    #[tokio::test(start_paused = true)]
    async fn source_meter_read_takes_the_configured_integration_time() {
        let config = SourceConfig {
            address: "GPIB0::24::INSTR".into(),
            integration_time: Duration::from_millis(200),
            source_voltage: 0.5,
            sample_interval: Duration::from_secs(1),
        };
        let mut meter = MockSourceMeter::from_config(&config);
        let mut link = meter.connect().await.unwrap();

        let start = tokio::time::Instant::now();
        meter.read_measurement(&mut link).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(meter.device_id(), "GPIB0::24::INSTR");
    }

    #[tokio::test]
    async fn source_meter_without_bias_rejects_reads() {
        let mut meter = MockSourceMeter::new("smu").with_bias(0.0);
        let mut link = meter.connect().await.unwrap();
        let err = meter.read_measurement(&mut link).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::Rejected);
    }

    #[tokio::test]
    async fn transient_read_failure_hits_only_that_attempt() {
        let mut meter = MockSourceMeter::new("smu").with_faults(FaultPlan {
            transient_read_failures: vec![2],
            ..FaultPlan::default()
        });
        let mut link = meter.connect().await.unwrap();
        assert!(meter.read_measurement(&mut link).await.is_ok());
        assert!(meter.read_measurement(&mut link).await.is_err());
        assert!(meter.read_measurement(&mut link).await.is_ok());
    }

    #[tokio::test]
    async fn flow_controller_readback_follows_setpoint() {
        let mut mfc = MockFlowController::new(ChannelId(8), 200.0).exact();
        let mut link = mfc.connect().await.unwrap();
        mfc.set_flow_setpoint(&mut link, ChannelId(8), 190.0)
            .await
            .unwrap();
        assert_eq!(mfc.read_measurement(&mut link).await.unwrap(), 190.0);
    }

    #[tokio::test]
    async fn flow_controller_rejects_out_of_range_and_foreign_channel() {
        let mut mfc = MockFlowController::new(ChannelId(7), 20.0);
        let journal = mfc.journal();
        let mut link = mfc.connect().await.unwrap();

        assert!(mfc.set_flow_setpoint(&mut link, ChannelId(7), 25.0).await.is_err());
        assert!(mfc.set_flow_setpoint(&mut link, ChannelId(8), 5.0).await.is_err());
        assert!(mfc.set_flow_setpoint(&mut link, ChannelId(7), 5.0).await.is_ok());
        assert_eq!(journal.accepted_writes(), vec![5.0]);
    }

    #[tokio::test]
    async fn journal_survives_moving_the_device() {
        let meter = MockSourceMeter::new("smu");
        let journal = meter.journal();
        let mut moved = meter;
        let link = moved.connect().await.unwrap();
        moved.disconnect(link).await;
        assert_eq!(
            journal.calls(),
            vec![MockCall::Connect { ok: true }, MockCall::Disconnect]
        );
    }
}
