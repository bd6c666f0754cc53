//! Gas-dosing protocols.
//!
//! A [`Protocol`] is the immutable, time-ordered list of [`SetpointSegment`]s
//! every flow controller walks during a session. It is produced by the
//! [`builder`] from a handful of physical parameters, checked against the
//! [`gas_line`] capacity, and can be persisted and reloaded through
//! [`artifact`] for reproducibility.
//!
//! All offsets are relative to the session epoch; flows are in sccm.

pub mod artifact;
pub mod builder;
pub mod gas_line;

pub use artifact::{load_protocol, persist_protocol, ProtocolArtifact};
pub use builder::{build_protocol, build_segments, PpmRange, ProtocolParams, RampSpec};
pub use gas_line::{ppm_to_setpoint, ChannelFlows, ChannelRole, FlowChannel, GasLine};

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Flow rate in sccm.
pub type Flow = f64;

/// Absolute tolerance used for every flow comparison.
pub const FLOW_TOLERANCE: Flow = 1e-6;

/// Identifier of one flow-controller channel (the controller's bus node).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// How a channel moves to a segment's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RampKind {
    /// Jump to the target at the segment start and hold it.
    Step,
    /// Part of a linear ramp, discretised into a staircase by the builder.
    #[default]
    Linear,
}

/// A contiguous interval during which one channel holds (or ramps toward) a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetpointSegment {
    /// Channel this segment drives.
    pub channel: ChannelId,
    /// Inclusive start, relative to the session epoch.
    #[serde(with = "humantime_serde")]
    pub start_offset: Duration,
    /// Exclusive end, relative to the session epoch.
    #[serde(with = "humantime_serde")]
    pub end_offset: Duration,
    /// Commanded flow in sccm.
    pub target_flow: Flow,
    /// Interpolation strategy this segment belongs to.
    pub ramp_kind: RampKind,
}

impl SetpointSegment {
    /// Length of the segment.
    pub fn duration(&self) -> Duration {
        self.end_offset.saturating_sub(self.start_offset)
    }

    /// Whether `offset` falls inside `[start, end)`.
    pub fn contains(&self, offset: Duration) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }
}

/// Parameters and provenance stored with a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    /// Parameters the protocol was generated from.
    pub params: ProtocolParams,
    /// Gas line the setpoints were computed for.
    pub gas_line: GasLine,
    /// Number of full cycles contained.
    pub cycles: u32,
    /// When the protocol was generated.
    pub generated_at: DateTime<Utc>,
}

/// Immutable, validated setpoint schedule shared read-only by all flow workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
    segments: Vec<SetpointSegment>,
    total_duration: Duration,
    metadata: ProtocolMetadata,
}

impl Protocol {
    /// Validate and freeze a segment list.
    ///
    /// Segments are sorted by `(start_offset, channel)`. Fails if any segment has
    /// zero length, if one channel's segments overlap, if a target exceeds its
    /// channel maximum, or if concurrently active targets exceed the total flow.
    pub fn new(mut segments: Vec<SetpointSegment>, metadata: ProtocolMetadata) -> AppResult<Self> {
        segments.sort_by(|a, b| {
            a.start_offset
                .cmp(&b.start_offset)
                .then(a.channel.cmp(&b.channel))
        });
        validate_segments(&segments, &metadata.gas_line)?;
        validate_capacity(&segments, &metadata.gas_line)?;

        let total_duration = segments
            .iter()
            .map(|s| s.end_offset)
            .max()
            .unwrap_or(Duration::ZERO);

        Ok(Self {
            segments,
            total_duration,
            metadata,
        })
    }

    /// All segments, ordered by start offset then channel.
    pub fn segments(&self) -> &[SetpointSegment] {
        &self.segments
    }

    /// End of the last segment (zero for an empty protocol).
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Originating parameters.
    pub fn metadata(&self) -> &ProtocolMetadata {
        &self.metadata
    }

    /// Whether the protocol contains no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Indices into [`Protocol::segments`] for one channel, in time order.
    pub fn channel_schedule(&self, channel: ChannelId) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.channel == channel)
            .map(|(i, _)| i)
            .collect()
    }

    /// Estimated gas consumption over the whole protocol.
    ///
    /// Per channel: the integral of `target_flow` over time, in litres.
    /// The analyte amount scales the analyte-channel volume by the cylinder
    /// concentration.
    pub fn estimated_gas_usage(&self) -> GasUsage {
        let mut per_channel_liters: BTreeMap<ChannelId, f64> = BTreeMap::new();
        for segment in &self.segments {
            let minutes = segment.duration().as_secs_f64() / 60.0;
            *per_channel_liters.entry(segment.channel).or_default() +=
                segment.target_flow * minutes / 1000.0;
        }

        let gas_line = &self.metadata.gas_line;
        let cylinder_liters = gas_line
            .analyte()
            .and_then(|analyte| per_channel_liters.get(&analyte.id).copied())
            .unwrap_or(0.0);

        GasUsage {
            analyte_microliters: cylinder_liters * gas_line.cylinder_ppm,
            cylinder_liters,
            per_channel_liters,
        }
    }

    /// Human-readable overview.
    pub fn summary(&self) -> ProtocolSummary {
        ProtocolSummary {
            total_duration: self.total_duration,
            cycles: self.metadata.cycles,
            segments: self.segments.len(),
            gas: self.estimated_gas_usage(),
        }
    }
}

/// Derived gas consumption figures.
#[derive(Debug, Clone, PartialEq)]
pub struct GasUsage {
    /// Volume drawn through each channel, in litres.
    pub per_channel_liters: BTreeMap<ChannelId, f64>,
    /// Volume drawn from the analyte cylinder, in litres.
    pub cylinder_liters: f64,
    /// Pure analyte contained in that volume, in microlitres.
    pub analyte_microliters: f64,
}

/// Overview printed when a protocol is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSummary {
    /// End of the last segment.
    pub total_duration: Duration,
    /// Full cycles.
    pub cycles: u32,
    /// Segment count across all channels.
    pub segments: usize,
    /// Estimated consumption.
    pub gas: GasUsage,
}

impl fmt::Display for ProtocolSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.total_duration.as_secs();
        write!(
            f,
            "Total time: {} h {} min ({} cycles, {} segments), cylinder gas usage: {:.2} L",
            secs / 3600,
            secs % 3600 / 60,
            self.cycles,
            self.segments,
            self.gas.cylinder_liters
        )
    }
}

fn validate_segments(segments: &[SetpointSegment], gas_line: &GasLine) -> AppResult<()> {
    let mut last_end: BTreeMap<ChannelId, Duration> = BTreeMap::new();

    for segment in segments {
        if segment.start_offset >= segment.end_offset {
            return Err(DaqError::DegenerateSegment {
                channel: segment.channel,
                offset: segment.start_offset,
            });
        }

        let max_flow = gas_line.max_flow(segment.channel).ok_or_else(|| {
            DaqError::Configuration(format!(
                "segment references unknown channel {}",
                segment.channel
            ))
        })?;
        if !(0.0..=max_flow).contains(&segment.target_flow) {
            return Err(DaqError::OutOfRange(format!(
                "target {:.3} sccm on {} outside [0, {:.3}]",
                segment.target_flow, segment.channel, max_flow
            )));
        }

        if let Some(previous_end) = last_end.insert(segment.channel, segment.end_offset) {
            if segment.start_offset < previous_end {
                return Err(DaqError::Configuration(format!(
                    "segments on {} overlap at {:?}",
                    segment.channel, segment.start_offset
                )));
            }
        }
    }
    Ok(())
}

/// Sweep over all segment boundaries and check the summed active flow.
fn validate_capacity(segments: &[SetpointSegment], gas_line: &GasLine) -> AppResult<()> {
    // (offset, is_start, flow); ends sort before starts at the same offset.
    let mut events: Vec<(Duration, bool, Flow)> = Vec::with_capacity(segments.len() * 2);
    for segment in segments {
        events.push((segment.start_offset, true, segment.target_flow));
        events.push((segment.end_offset, false, segment.target_flow));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let limit = gas_line.total_flow_sccm + FLOW_TOLERANCE;
    let mut active = 0.0;
    let mut i = 0;
    while i < events.len() {
        let offset = events[i].0;
        while i < events.len() && events[i].0 == offset {
            let (_, is_start, flow) = events[i];
            if is_start {
                active += flow;
            } else {
                active -= flow;
            }
            i += 1;
        }
        if active > limit {
            return Err(DaqError::Configuration(format!(
                "combined flow {:.3} sccm at {:?} exceeds total flow {:.3} sccm",
                active, offset, gas_line.total_flow_sccm
            )));
        }
    }
    Ok(())
}
