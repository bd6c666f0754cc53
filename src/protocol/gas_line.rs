//! Gas line model and ppm → per-channel setpoint conversion.
//!
//! One channel carries the analyte from a certified cylinder; carrier channels
//! dilute it so the summed flow equals the configured total. The concentration
//! seen by the sensor is `analyte_flow / total_flow × cylinder_ppm`.

use super::{ChannelId, Flow, FLOW_TOLERANCE};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Setpoint for every channel of a gas line.
pub type ChannelFlows = BTreeMap<ChannelId, Flow>;

/// What a channel contributes to the mixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Carries gas from the analyte cylinder.
    Analyte,
    /// Carries diluting gas; absorbs the remainder of the total flow.
    Carrier,
    /// Connected but unused; always driven to zero.
    Idle,
}

/// One mass-flow controller channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowChannel {
    /// Bus node of the controller.
    #[serde(rename = "node")]
    pub id: ChannelId,
    /// Role in the mixture.
    pub role: ChannelRole,
    /// Full-scale flow of the controller.
    pub max_flow_sccm: Flow,
}

impl FlowChannel {
    /// Shorthand constructor.
    pub fn new(node: u8, role: ChannelRole, max_flow_sccm: Flow) -> Self {
        Self {
            id: ChannelId(node),
            role,
            max_flow_sccm,
        }
    }
}

/// The set of channels feeding the sensor chamber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasLine {
    /// Channels in configured order; carriers are filled in this order.
    pub channels: Vec<FlowChannel>,
    /// Flow through the chamber.
    pub total_flow_sccm: Flow,
    /// Analyte concentration of the source cylinder.
    pub cylinder_ppm: f64,
}

impl GasLine {
    /// Build and validate a gas line.
    pub fn new(channels: Vec<FlowChannel>, total_flow_sccm: Flow, cylinder_ppm: f64) -> AppResult<Self> {
        let line = Self {
            channels,
            total_flow_sccm,
            cylinder_ppm,
        };
        line.validate()?;
        Ok(line)
    }

    /// Structural checks: one analyte channel, unique nodes, positive limits.
    pub fn validate(&self) -> AppResult<()> {
        if self.channels.is_empty() {
            return Err(DaqError::Configuration("gas line has no channels".into()));
        }
        let analytes = self
            .channels
            .iter()
            .filter(|c| c.role == ChannelRole::Analyte)
            .count();
        if analytes != 1 {
            return Err(DaqError::Configuration(format!(
                "gas line needs exactly one analyte channel, found {}",
                analytes
            )));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(DaqError::Configuration(format!(
                    "duplicate channel {}",
                    channel.id
                )));
            }
            if !(channel.max_flow_sccm.is_finite() && channel.max_flow_sccm > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "channel {} max flow must be positive",
                    channel.id
                )));
            }
        }
        if !(self.total_flow_sccm.is_finite() && self.total_flow_sccm > 0.0) {
            return Err(DaqError::Configuration("total flow must be positive".into()));
        }
        if !(self.cylinder_ppm.is_finite() && self.cylinder_ppm > 0.0) {
            return Err(DaqError::Configuration(
                "cylinder concentration must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The analyte channel, if the line is well formed.
    pub fn analyte(&self) -> Option<&FlowChannel> {
        self.channels.iter().find(|c| c.role == ChannelRole::Analyte)
    }

    /// Full-scale flow of `channel`.
    pub fn max_flow(&self, channel: ChannelId) -> Option<Flow> {
        self.channels
            .iter()
            .find(|c| c.id == channel)
            .map(|c| c.max_flow_sccm)
    }

    /// Node ids in configured order.
    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().map(|c| c.id)
    }

    /// Highest concentration this line can deliver.
    pub fn max_ppm(&self) -> f64 {
        self.analyte()
            .map(|a| {
                (a.max_flow_sccm / self.total_flow_sccm).min(1.0) * self.cylinder_ppm
            })
            .unwrap_or(0.0)
    }

    /// Per-channel setpoints delivering `ppm_target` at this line's total flow.
    pub fn ppm_to_setpoint(&self, ppm_target: f64) -> AppResult<ChannelFlows> {
        ppm_to_setpoint(
            ppm_target,
            self.total_flow_sccm,
            &self.channels,
            self.cylinder_ppm,
        )
    }
}

/// Split `total_flow` across `channels` so the mixture reaches `ppm_target`.
///
/// The analyte channel gets `total_flow × ppm_target / cylinder_ppm`; carrier
/// channels take the remainder greedily in order, each up to its maximum; idle
/// channels get zero. The result sums to `total_flow`.
///
/// # Errors
///
/// `OutOfRange` when the target is negative or above the cylinder
/// concentration, when the analyte flow exceeds the analyte maximum, or when
/// `total_flow` exceeds the combined capacity of analyte and carriers.
pub fn ppm_to_setpoint(
    ppm_target: f64,
    total_flow: Flow,
    channels: &[FlowChannel],
    cylinder_ppm: f64,
) -> AppResult<ChannelFlows> {
    if !ppm_target.is_finite() || ppm_target < 0.0 || ppm_target > cylinder_ppm {
        return Err(DaqError::OutOfRange(format!(
            "{} ppm is outside [0, {}] ppm for this cylinder",
            ppm_target, cylinder_ppm
        )));
    }

    let capacity: Flow = channels
        .iter()
        .filter(|c| c.role != ChannelRole::Idle)
        .map(|c| c.max_flow_sccm)
        .sum();
    if total_flow > capacity + FLOW_TOLERANCE {
        return Err(DaqError::OutOfRange(format!(
            "total flow {:.3} sccm exceeds combined channel capacity {:.3} sccm",
            total_flow, capacity
        )));
    }

    let analyte = channels
        .iter()
        .find(|c| c.role == ChannelRole::Analyte)
        .ok_or_else(|| DaqError::Configuration("no analyte channel".into()))?;
    let analyte_flow = total_flow * ppm_target / cylinder_ppm;
    if analyte_flow > analyte.max_flow_sccm + FLOW_TOLERANCE {
        return Err(DaqError::OutOfRange(format!(
            "{} ppm needs {:.3} sccm on {}, above its {:.3} sccm maximum",
            ppm_target, analyte_flow, analyte.id, analyte.max_flow_sccm
        )));
    }
    // Rounding at the analyte maximum must not leave a target the controller rejects.
    let analyte_flow = analyte_flow.clamp(0.0, analyte.max_flow_sccm);

    let mut flows = ChannelFlows::new();
    let mut remaining = total_flow - analyte_flow;
    for channel in channels {
        let flow = match channel.role {
            ChannelRole::Analyte => analyte_flow,
            ChannelRole::Idle => 0.0,
            ChannelRole::Carrier => {
                let share = remaining.clamp(0.0, channel.max_flow_sccm);
                remaining -= share;
                share
            }
        };
        flows.insert(channel.id, flow);
    }

    if remaining > FLOW_TOLERANCE {
        return Err(DaqError::OutOfRange(format!(
            "carriers cannot absorb the remaining {:.3} sccm at {} ppm",
            remaining, ppm_target
        )));
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bench_line() -> Vec<FlowChannel> {
        vec![
            FlowChannel::new(7, ChannelRole::Analyte, 20.0),
            FlowChannel::new(8, ChannelRole::Carrier, 200.0),
        ]
    }

    fn sum(flows: &ChannelFlows) -> f64 {
        flows.values().sum()
    }

    #[test]
    fn fifty_ppm_fits_a_twenty_sccm_analyte_channel() {
        let flows = ppm_to_setpoint(50.0, 200.0, &bench_line(), 1000.0).unwrap();
        assert!((flows[&ChannelId(7)] - 10.0).abs() < 1e-9);
        assert!((flows[&ChannelId(8)] - 190.0).abs() < 1e-9);
        assert!((sum(&flows) - 200.0).abs() < 1e-9);
    }

    #[test]
    fn five_hundred_ppm_exceeds_analyte_maximum() {
        let err = ppm_to_setpoint(500.0, 200.0, &bench_line(), 1000.0).unwrap_err();
        assert!(matches!(err, DaqError::OutOfRange(msg) if msg.contains("100.000 sccm")));
    }

    #[test]
    fn total_above_capacity_is_rejected() {
        let err = ppm_to_setpoint(0.0, 250.0, &bench_line(), 1000.0).unwrap_err();
        assert!(matches!(err, DaqError::OutOfRange(_)));
    }

    #[test]
    fn negative_ppm_is_rejected() {
        assert!(ppm_to_setpoint(-1.0, 200.0, &bench_line(), 1000.0).is_err());
    }

    #[test]
    fn carriers_fill_in_order_and_idle_stays_closed() {
        // Four-node bench: analyte, two 50 sccm carriers, one spare.
        let channels = vec![
            FlowChannel::new(7, ChannelRole::Analyte, 50.0),
            FlowChannel::new(8, ChannelRole::Carrier, 50.0),
            FlowChannel::new(9, ChannelRole::Carrier, 50.0),
            FlowChannel::new(11, ChannelRole::Idle, 50.0),
        ];
        let flows = ppm_to_setpoint(20.0, 100.0, &channels, 100.0).unwrap();
        assert!((flows[&ChannelId(7)] - 20.0).abs() < 1e-9);
        assert!((flows[&ChannelId(8)] - 50.0).abs() < 1e-9);
        assert!((flows[&ChannelId(9)] - 30.0).abs() < 1e-9);
        assert_eq!(flows[&ChannelId(11)], 0.0);
        assert!((sum(&flows) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn feasible_grid_sums_to_total_and_respects_maxima() {
        let channels = vec![
            FlowChannel::new(7, ChannelRole::Analyte, 50.0),
            FlowChannel::new(8, ChannelRole::Carrier, 50.0),
            FlowChannel::new(9, ChannelRole::Carrier, 50.0),
        ];
        for total in [20.0, 55.5, 100.0] {
            let line = GasLine::new(channels.clone(), total, 100.0).unwrap();
            let mut ppm = 0.0;
            while ppm <= line.max_ppm() {
                let flows = line.ppm_to_setpoint(ppm).unwrap();
                assert!((sum(&flows) - total).abs() < 1e-6, "total {total} ppm {ppm}");
                for channel in &channels {
                    assert!(flows[&channel.id] <= channel.max_flow_sccm);
                    assert!(flows[&channel.id] >= 0.0);
                }
                ppm += 0.25;
            }
        }
    }

    #[test]
    fn targets_at_max_ppm_never_exceed_channel_maxima() {
        for analyte_max in [0.23, 0.7, 1.1, 3.3, 19.9] {
            for total in [7.0, 99.9, 133.0, 199.7] {
                let channels = vec![
                    FlowChannel::new(7, ChannelRole::Analyte, analyte_max),
                    FlowChannel::new(8, ChannelRole::Carrier, total),
                ];
                let line = GasLine::new(channels.clone(), total, 1000.0).unwrap();
                let flows = line.ppm_to_setpoint(line.max_ppm()).unwrap();
                for channel in &channels {
                    let flow = flows[&channel.id];
                    assert!(
                        (0.0..=channel.max_flow_sccm).contains(&flow),
                        "max {} total {} flow {}",
                        channel.max_flow_sccm,
                        total,
                        flow
                    );
                }
            }
        }
    }

    #[test]
    fn gas_line_requires_single_analyte() {
        let err = GasLine::new(
            vec![FlowChannel::new(8, ChannelRole::Carrier, 50.0)],
            50.0,
            100.0,
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn gas_line_rejects_duplicate_nodes() {
        let err = GasLine::new(
            vec![
                FlowChannel::new(7, ChannelRole::Analyte, 50.0),
                FlowChannel::new(7, ChannelRole::Carrier, 50.0),
            ],
            50.0,
            100.0,
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("duplicate")));
    }
}
