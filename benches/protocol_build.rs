//! Criterion benchmarks for protocol generation.
//!
//! Long linear ramps with short stairs produce tens of thousands of segments,
//! all of which are built and validated before a session starts.
//!
//! Run with: cargo bench --bench protocol_build

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gas_daq::protocol::{
    build_protocol, ppm_to_setpoint, ChannelRole, FlowChannel, GasLine, PpmRange, ProtocolParams,
};
use std::time::Duration;

fn gas_line() -> GasLine {
    GasLine::new(
        vec![
            FlowChannel::new(7, ChannelRole::Analyte, 20.0),
            FlowChannel::new(8, ChannelRole::Carrier, 200.0),
            FlowChannel::new(9, ChannelRole::Carrier, 100.0),
            FlowChannel::new(10, ChannelRole::Idle, 50.0),
        ],
        250.0,
        1000.0,
    )
    .unwrap()
}

fn setpoint_conversion(c: &mut Criterion) {
    let line = gas_line();
    c.bench_function("ppm_to_setpoint", |b| {
        b.iter(|| {
            ppm_to_setpoint(
                black_box(42.5),
                line.total_flow_sccm,
                &line.channels,
                line.cylinder_ppm,
            )
        })
    });
}

/// Full builds at decreasing stair lengths.
fn linear_protocol(c: &mut Criterion) {
    let line = gas_line();
    let mut group = c.benchmark_group("build_protocol_linear");

    for step_secs in [60u64, 10, 1] {
        let params = ProtocolParams {
            range: PpmRange::Ramp {
                start: 0.0,
                end: 50.0,
            },
            speeds_ppm_per_min: vec![0.5, 1.0, 2.0],
            speed_repeat: 2,
            ramp_step: Duration::from_secs(step_secs),
            ..ProtocolParams::default()
        };
        let segments = build_protocol(&params, &line).unwrap().segments().len();
        group.throughput(Throughput::Elements(segments as u64));
        group.bench_with_input(BenchmarkId::from_parameter(step_secs), &params, |b, params| {
            b.iter(|| build_protocol(black_box(params), &line).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, setpoint_conversion, linear_protocol);
criterion_main!(benches);
