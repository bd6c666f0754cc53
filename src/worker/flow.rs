//! Flow controller role: walk the protocol for one channel.
//!
//! The role keeps a cursor into the channel's segments. Each tick it advances
//! the cursor past segments that have ended, writes the active segment's
//! target if that segment has not been written yet, and then reads back the
//! actual flow. A segment is marked written only once the device accepts the
//! write, so a rejected write is retried on the next tick and a successful one
//! is never repeated. Segments that ended before the worker connected are
//! skipped without being written.

use super::{SampleRole, Tick, WorkerRole};
use crate::data::{LogRecord, FLOW_HEADER};
use crate::error::TransportError;
use crate::hardware::Actuatable;
use crate::protocol::{ChannelId, Flow, Protocol, SetpointSegment};
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Drives one channel through a shared protocol.
#[derive(Debug, Clone)]
pub struct FlowRole {
    channel: ChannelId,
    protocol: Arc<Protocol>,
    schedule: Vec<usize>,
    cursor: usize,
    written: Option<usize>,
    setpoint: Flow,
    park_on_stop: bool,
}

impl FlowRole {
    /// Follow `protocol` on `channel`. Parks at zero on stop by default.
    pub fn new(channel: ChannelId, protocol: Arc<Protocol>) -> Self {
        let schedule = protocol.channel_schedule(channel);
        Self {
            channel,
            protocol,
            schedule,
            cursor: 0,
            written: None,
            setpoint: 0.0,
            park_on_stop: true,
        }
    }

    /// Whether to command zero flow when the worker stops.
    pub fn park_on_stop(mut self, park: bool) -> Self {
        self.park_on_stop = park;
        self
    }

    /// Segment active at `elapsed`, advancing the cursor past ended ones.
    fn active_segment(&mut self, elapsed: Duration) -> Option<(usize, SetpointSegment)> {
        let segments = self.protocol.segments();
        while let Some(&index) = self.schedule.get(self.cursor) {
            if segments[index].end_offset > elapsed {
                break;
            }
            self.cursor += 1;
        }
        let index = *self.schedule.get(self.cursor)?;
        let segment = &segments[index];
        segment
            .contains(elapsed)
            .then(|| (self.cursor, segment.clone()))
    }
}

#[async_trait]
impl<D: Actuatable> SampleRole<D> for FlowRole {
    fn role(&self) -> WorkerRole {
        WorkerRole::Flow {
            channel: self.channel,
        }
    }

    fn header(&self) -> &'static [&'static str] {
        &FLOW_HEADER
    }

    async fn tick(
        &mut self,
        device: &mut D,
        handle: &mut D::Handle,
        elapsed: Duration,
    ) -> Result<Tick, TransportError> {
        if elapsed >= self.protocol.total_duration() {
            return Ok(Tick::Complete);
        }

        if let Some((position, segment)) = self.active_segment(elapsed) {
            if self.written != Some(position) {
                device
                    .set_flow_setpoint(handle, self.channel, segment.target_flow)
                    .await?;
                self.written = Some(position);
                self.setpoint = segment.target_flow;
                info!(
                    channel = %self.channel,
                    segment = position,
                    setpoint = segment.target_flow,
                    "setpoint written"
                );
            }
        }

        let readback = device.read_measurement(handle).await?;
        Ok(Tick::Sampled(LogRecord::Flow {
            timestamp: Local::now(),
            channel: self.channel,
            setpoint: self.setpoint,
            readback,
        }))
    }

    async fn on_stop(&mut self, device: &mut D, handle: &mut D::Handle) {
        if !self.park_on_stop {
            return;
        }
        match device.set_flow_setpoint(handle, self.channel, 0.0).await {
            Ok(()) => {
                self.setpoint = 0.0;
                info!(channel = %self.channel, "parked at zero flow");
            }
            Err(err) => warn!(channel = %self.channel, error = %err, "could not park channel"),
        }
    }
}
