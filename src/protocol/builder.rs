//! Expands physical experiment parameters into setpoint segments.
//!
//! A ramp cycle is: settle at `start`, ramp to `end`, hold at `end`, ramp back
//! to `start`. A levels cycle settles at the first level and then steps through
//! the rest, holding each one. Cycles are laid end to end; each one starts where
//! the previous one ended.
//!
//! `RampKind::Linear` ramps become a staircase with `ramp_step` resolution, each
//! stair targeting the interpolated concentration at its end, so a flow worker
//! issues one write per stair.

use super::gas_line::{ChannelFlows, GasLine};
use super::{ChannelId, Protocol, ProtocolMetadata, RampKind, SetpointSegment};
use crate::error::{AppResult, DaqError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Concentrations visited by one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PpmRange {
    /// Ramp between two bounds and back.
    Ramp {
        /// Baseline concentration.
        start: f64,
        /// Turning-point concentration.
        end: f64,
    },
    /// Step through a list of concentrations.
    Levels {
        /// First entry is the baseline.
        levels: Vec<f64>,
    },
}

impl PpmRange {
    fn is_ramp(&self) -> bool {
        matches!(self, PpmRange::Ramp { .. })
    }
}

/// Timing of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RampSpec {
    /// Ramp speed; unused by level cycles.
    pub speed_ppm_per_min: f64,
    /// Time at the baseline at the start of each cycle.
    pub settle: Duration,
    /// Time at the turning point (or at each level).
    pub hold: Duration,
    /// Ramp interpolation.
    pub ramp_kind: RampKind,
    /// Stair length for linear ramps.
    pub ramp_step: Duration,
}

/// Everything needed to regenerate a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Concentration range.
    pub range: PpmRange,
    /// One ramp speed per block of `speed_repeat` cycles.
    #[serde(default = "default_speeds")]
    pub speeds_ppm_per_min: Vec<f64>,
    /// Cycles per speed.
    #[serde(default = "default_repeat")]
    pub speed_repeat: u32,
    /// Repetitions of the whole speed list.
    #[serde(default = "default_repeat")]
    pub protocol_repeat: u32,
    /// Baseline time per cycle.
    #[serde(default = "default_settle_time", with = "humantime_serde")]
    pub settle_time: Duration,
    /// Turning-point time per cycle; defaults to `settle_time`.
    #[serde(default, with = "humantime_serde")]
    pub hold_time: Option<Duration>,
    /// Ramp interpolation.
    #[serde(default)]
    pub ramp_kind: RampKind,
    /// Stair length for linear ramps.
    #[serde(default = "default_ramp_step", with = "humantime_serde")]
    pub ramp_step: Duration,
}

fn default_speeds() -> Vec<f64> {
    vec![1.0]
}

fn default_repeat() -> u32 {
    1
}

fn default_settle_time() -> Duration {
    Duration::from_secs(60)
}

fn default_ramp_step() -> Duration {
    Duration::from_secs(1)
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            range: PpmRange::Ramp {
                start: 0.0,
                end: 20.0,
            },
            speeds_ppm_per_min: default_speeds(),
            speed_repeat: default_repeat(),
            protocol_repeat: default_repeat(),
            settle_time: default_settle_time(),
            hold_time: None,
            ramp_kind: RampKind::default(),
            ramp_step: default_ramp_step(),
        }
    }
}

impl ProtocolParams {
    /// Turning-point time.
    pub fn hold(&self) -> Duration {
        self.hold_time.unwrap_or(self.settle_time)
    }

    /// Speeds iterated per protocol repetition (a single pass for level cycles).
    fn cycle_speeds(&self) -> Vec<f64> {
        if self.range.is_ramp() {
            self.speeds_ppm_per_min.clone()
        } else {
            vec![0.0]
        }
    }

    /// Total number of cycles the protocol will contain.
    pub fn cycles(&self) -> u32 {
        let speeds = self.cycle_speeds().len() as u32;
        speeds
            .saturating_mul(self.speed_repeat)
            .saturating_mul(self.protocol_repeat)
    }

    /// Timing for cycles at `speed_ppm_per_min`.
    pub fn ramp_spec(&self, speed_ppm_per_min: f64) -> RampSpec {
        RampSpec {
            speed_ppm_per_min,
            settle: self.settle_time,
            hold: self.hold(),
            ramp_kind: self.ramp_kind,
            ramp_step: self.ramp_step,
        }
    }

    /// Parameter checks that do not depend on the gas line.
    pub fn validate(&self) -> AppResult<()> {
        match &self.range {
            PpmRange::Ramp { start, end } => {
                if !(start.is_finite() && end.is_finite()) {
                    return Err(DaqError::Configuration("ppm range must be finite".into()));
                }
                if self.speeds_ppm_per_min.is_empty() {
                    return Err(DaqError::Configuration(
                        "at least one ramp speed is required".into(),
                    ));
                }
                if let Some(bad) = self
                    .speeds_ppm_per_min
                    .iter()
                    .find(|s| !(s.is_finite() && **s > 0.0))
                {
                    return Err(DaqError::Configuration(format!(
                        "ramp speed {} ppm/min must be positive",
                        bad
                    )));
                }
            }
            PpmRange::Levels { levels } => {
                if levels.is_empty() {
                    return Err(DaqError::Configuration("ppm level list is empty".into()));
                }
                if levels.iter().any(|l| !l.is_finite()) {
                    return Err(DaqError::Configuration("ppm levels must be finite".into()));
                }
            }
        }
        if self.ramp_step.is_zero() {
            return Err(DaqError::Configuration("ramp step must be positive".into()));
        }
        Ok(())
    }
}

/// Expand `repeats` cycles of `range` into segments starting at offset zero.
///
/// Returns an empty list for zero repeats.
pub fn build_segments(
    range: &PpmRange,
    timing: &RampSpec,
    repeats: u32,
    gas_line: &GasLine,
) -> AppResult<Vec<SetpointSegment>> {
    let mut planner = SegmentPlanner::new(gas_line);
    planner.push_cycles(range, timing, repeats)?;
    Ok(planner.finish())
}

/// Build the full, validated protocol for `params` on `gas_line`.
///
/// For every protocol repetition, each speed contributes `speed_repeat`
/// consecutive cycles.
pub fn build_protocol(params: &ProtocolParams, gas_line: &GasLine) -> AppResult<Protocol> {
    params.validate()?;
    gas_line.validate()?;

    let mut planner = SegmentPlanner::new(gas_line);
    for _ in 0..params.protocol_repeat {
        for speed in params.cycle_speeds() {
            planner.push_cycles(&params.range, &params.ramp_spec(speed), params.speed_repeat)?;
        }
    }

    let protocol = Protocol::new(
        planner.finish(),
        ProtocolMetadata {
            params: params.clone(),
            gas_line: gas_line.clone(),
            cycles: params.cycles(),
            generated_at: Utc::now(),
        },
    )?;
    info!(summary = %protocol.summary(), "protocol built");
    Ok(protocol)
}

struct SegmentPlanner<'a> {
    gas_line: &'a GasLine,
    cursor: Duration,
    segments: Vec<SetpointSegment>,
}

impl<'a> SegmentPlanner<'a> {
    fn new(gas_line: &'a GasLine) -> Self {
        Self {
            gas_line,
            cursor: Duration::ZERO,
            segments: Vec::new(),
        }
    }

    fn push_cycles(&mut self, range: &PpmRange, timing: &RampSpec, repeats: u32) -> AppResult<()> {
        for _ in 0..repeats {
            self.push_cycle(range, timing)?;
        }
        Ok(())
    }

    fn push_cycle(&mut self, range: &PpmRange, timing: &RampSpec) -> AppResult<()> {
        match range {
            PpmRange::Ramp { start, end } => {
                self.push_hold(*start, timing.settle)?;
                self.push_ramp(*start, *end, timing)?;
                self.push_hold(*end, timing.hold)?;
                self.push_ramp(*end, *start, timing)
            }
            PpmRange::Levels { levels } => {
                let (baseline, rest) = levels
                    .split_first()
                    .ok_or_else(|| DaqError::Configuration("ppm level list is empty".into()))?;
                self.push_hold(*baseline, timing.settle)?;
                for level in rest {
                    self.push_hold(*level, timing.hold)?;
                }
                Ok(())
            }
        }
    }

    fn push_hold(&mut self, ppm: f64, duration: Duration) -> AppResult<()> {
        let flows = self.gas_line.ppm_to_setpoint(ppm)?;
        self.emit(&flows, duration, RampKind::Step)
    }

    fn push_ramp(&mut self, from: f64, to: f64, timing: &RampSpec) -> AppResult<()> {
        let minutes = (to - from).abs() / timing.speed_ppm_per_min;
        let duration = Duration::try_from_secs_f64(minutes * 60.0)
            .map_err(|e| DaqError::Configuration(format!("invalid ramp duration: {}", e)))?;

        match timing.ramp_kind {
            RampKind::Step => {
                let flows = self.gas_line.ppm_to_setpoint(to)?;
                self.emit(&flows, duration, RampKind::Step)
            }
            RampKind::Linear => {
                if duration.is_zero() {
                    return Err(self.degenerate());
                }
                let total = duration.as_nanos();
                let stair = timing.ramp_step.as_nanos().max(1);
                let mut done: u128 = 0;
                while done < total {
                    let next = (done + stair).min(total);
                    let ppm = if next == total {
                        to
                    } else {
                        from + (to - from) * (next as f64 / total as f64)
                    };
                    let flows = self.gas_line.ppm_to_setpoint(ppm)?;
                    let length = Duration::from_nanos((next - done) as u64);
                    self.emit(&flows, length, RampKind::Linear)?;
                    done = next;
                }
                Ok(())
            }
        }
    }

    fn emit(&mut self, flows: &ChannelFlows, duration: Duration, kind: RampKind) -> AppResult<()> {
        if duration.is_zero() {
            return Err(self.degenerate());
        }
        let end = self
            .cursor
            .checked_add(duration)
            .ok_or_else(|| DaqError::Configuration("protocol duration overflow".into()))?;
        for (&channel, &target_flow) in flows {
            self.segments.push(SetpointSegment {
                channel,
                start_offset: self.cursor,
                end_offset: end,
                target_flow,
                ramp_kind: kind,
            });
        }
        self.cursor = end;
        Ok(())
    }

    fn degenerate(&self) -> DaqError {
        DaqError::DegenerateSegment {
            channel: self
                .gas_line
                .analyte()
                .map(|a| a.id)
                .unwrap_or(ChannelId(0)),
            offset: self.cursor,
        }
    }

    fn finish(self) -> Vec<SetpointSegment> {
        self.segments
    }
}
