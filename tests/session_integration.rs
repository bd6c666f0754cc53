//! End-to-end session tests against mock devices.
//!
//! Time is paused, so multi-minute protocols run instantly.

use chrono::DateTime;
use gas_daq::config::SessionConfig;
use gas_daq::hardware::mock::{FaultPlan, MockDeviceProvider};
use gas_daq::protocol::load_protocol;
use gas_daq::session::{run_session, SessionOutcome};
use gas_daq::shutdown::{self, ShutdownSignal};
use gas_daq::worker::{StopReason, WorkerStatus};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

const SOURCE: &str = "GPIB0::24::INSTR";

/// 0 → 2 ppm and back at 2 ppm/min with 10 s settle and hold: 140 s in total.
fn config(data_dir: &Path, range: &str) -> SessionConfig {
    let text = format!(
        r#"
[application]
name = "session-test"

[experiment]
data_dir = '{}'
post_protocol = "2s"

[source]
address = "{}"
sample_interval = "1s"

[mfc]
port = "/dev/null"
total_flow_sccm = 200.0
cylinder_ppm = 1000.0
vessel = "chamber B"
sample_interval = "1s"
channels = [
    {{ node = 7, role = "analyte", max_flow_sccm = 20.0 }},
    {{ node = 8, role = "carrier", max_flow_sccm = 200.0 }},
]

[protocol]
range = {}
speeds_ppm_per_min = [2.0]
settle_time = "10s"
hold_time = "10s"
ramp_kind = "step"

[worker]
backoff = "10ms"
"#,
        data_dir.display(),
        SOURCE,
        range
    );
    SessionConfig::from_toml_str(&text).unwrap()
}

const SHORT_RAMP: &str = r#"{ kind = "ramp", start = 0.0, end = 2.0 }"#;

/// Read a log, asserting the header and that every row parses.
fn read_log(path: &Path, header: &[&str]) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let found: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(found, header);

    reader
        .records()
        .map(|row| {
            let row = row.unwrap();
            assert_eq!(row.len(), header.len());
            DateTime::parse_from_rfc3339(&row[0]).unwrap();
            for field in row.iter().skip(1) {
                field.parse::<f64>().unwrap();
            }
            row.iter().map(String::from).collect()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn full_session_runs_protocol_to_completion() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), SHORT_RAMP);
    let mut provider = MockDeviceProvider::new();

    let result = run_session(&config, &mut provider, ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(result.outcome(), SessionOutcome::Success);
    assert_eq!(result.total_duration, Duration::from_secs(140));
    assert_eq!(result.vessel, "chamber B");
    assert_eq!(result.workers.len(), 3);
    for worker in &result.workers {
        assert_eq!(worker.status, WorkerStatus::Stopped);
        assert_eq!(worker.stop_reason, Some(StopReason::ScheduleComplete));
    }

    // Measurement continues through the post-protocol window.
    let measurement = result.worker(SOURCE).unwrap();
    let rows = read_log(&measurement.log_path, &["timestamp", "value"]);
    assert_eq!(rows.len() as u64, measurement.records_written);
    assert!((141..=143).contains(&rows.len()), "{} rows", rows.len());

    let analyte = result.flow_worker(7).unwrap();
    let rows = read_log(&analyte.log_path, &["timestamp", "channel", "setpoint", "readback"]);
    assert!((139..=141).contains(&rows.len()), "{} rows", rows.len());
    assert!(rows.iter().all(|r| r[1] == "7"));
    assert!(rows.iter().any(|r| r[2] == "0.400"));

    // settle 0, step up, hold, step down, then parked at zero
    let writes = provider.journal("mfc-node7").unwrap().accepted_writes();
    assert_eq!(writes.len(), 5);
    for (written, expected) in writes.iter().zip([0.0, 0.4, 0.4, 0.0, 0.0]) {
        assert!((written - expected).abs() < 1e-9, "{:?}", writes);
    }
    let carrier = provider.journal("mfc-node8").unwrap().accepted_writes();
    assert!((carrier[1] - 199.6).abs() < 1e-9, "{:?}", carrier);

    let artifact = result.protocol_path.as_ref().unwrap();
    assert!(artifact.starts_with(dir.path()));
    let reloaded = load_protocol(artifact).unwrap();
    assert_eq!(reloaded.total_duration(), result.total_duration);
}

#[tokio::test(start_paused = true)]
async fn failing_controller_does_not_stop_siblings() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), SHORT_RAMP);
    let mut provider = MockDeviceProvider::new().with_flow_faults(
        8,
        FaultPlan {
            reject_writes: true,
            ..FaultPlan::default()
        },
    );
    let (handle, signal) = shutdown::channel();

    let (result, _) = tokio::join!(run_session(&config, &mut provider, signal), async {
        tokio::time::sleep(Duration::from_secs(20)).await;
        handle.trigger();
    });
    let result = result.unwrap();

    assert_eq!(
        result.outcome(),
        SessionOutcome::PartialFailure {
            failed: vec!["mfc-node8".to_string()]
        }
    );

    let carrier = result.flow_worker(8).unwrap();
    assert!(matches!(carrier.stop_reason, Some(StopReason::Fatal(_))));
    assert_eq!(carrier.transient_errors, 5);
    assert!(read_log(&carrier.log_path, &["timestamp", "channel", "setpoint", "readback"]).is_empty());

    let measurement = result.worker(SOURCE).unwrap();
    assert_eq!(measurement.status, WorkerStatus::Stopped);
    assert_eq!(measurement.stop_reason, Some(StopReason::External));
    let rows = read_log(&measurement.log_path, &["timestamp", "value"]);
    assert!((19..=21).contains(&rows.len()), "{} rows", rows.len());

    let analyte = result.flow_worker(7).unwrap();
    assert_eq!(analyte.status, WorkerStatus::Stopped);
    assert_eq!(analyte.stop_reason, Some(StopReason::External));
    assert!(!read_log(&analyte.log_path, &["timestamp", "channel", "setpoint", "readback"]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn infeasible_protocol_aborts_before_hardware() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("session");
    // The analyte controller tops out at 100 ppm on this line.
    let config = config(&data_dir, r#"{ kind = "ramp", start = 0.0, end = 500.0 }"#);
    let mut provider = MockDeviceProvider::new();

    let err = run_session(&config, &mut provider, ShutdownSignal::never())
        .await
        .unwrap_err();

    assert!(err.is_build_error(), "{}", err);
    assert!(provider.journal(SOURCE).is_none());
    assert!(provider.journal("mfc-node7").is_none());
    assert!(!data_dir.exists());
}

#[tokio::test(start_paused = true)]
async fn stop_before_connect_still_stops_cleanly() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), SHORT_RAMP);
    let mut provider = MockDeviceProvider::new().with_source_faults(FaultPlan {
        connect_failures: 10,
        ..FaultPlan::default()
    });
    let (handle, signal) = shutdown::channel();

    let (result, _) = tokio::join!(run_session(&config, &mut provider, signal), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.trigger();
    });
    let result = result.unwrap();

    let measurement = result.worker(SOURCE).unwrap();
    assert_eq!(measurement.status, WorkerStatus::Stopped);
    assert_eq!(measurement.stop_reason, Some(StopReason::External));
    assert_eq!(measurement.records_written, 0);
    assert_eq!(result.outcome(), SessionOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn session_replays_saved_artifact() {
    let dir = tempdir().unwrap();
    let first = config(&dir.path().join("first"), SHORT_RAMP);
    let mut provider = MockDeviceProvider::new();
    let original = run_session(&first, &mut provider, ShutdownSignal::never())
        .await
        .unwrap();
    let artifact = original.protocol_path.clone().unwrap();

    // Different [protocol] parameters are ignored when an artifact is named.
    let mut replay = config(
        &dir.path().join("replay"),
        r#"{ kind = "levels", levels = [0.0, 1.0] }"#,
    );
    replay.experiment.protocol_artifact = Some(artifact.clone());
    replay.experiment.save_protocol = false;

    let mut provider = MockDeviceProvider::new();
    let result = run_session(&replay, &mut provider, ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!(result.outcome(), SessionOutcome::Success);
    assert_eq!(result.total_duration, original.total_duration);
    assert!(result.protocol_path.is_none());
    assert_eq!(
        provider.journal("mfc-node7").unwrap().accepted_writes().len(),
        5
    );
}

#[tokio::test(start_paused = true)]
async fn artifact_for_other_nodes_is_rejected() {
    let dir = tempdir().unwrap();
    let first = config(&dir.path().join("first"), SHORT_RAMP);
    let original = run_session(&first, &mut MockDeviceProvider::new(), ShutdownSignal::never())
        .await
        .unwrap();

    let mut replay = config(&dir.path().join("replay"), SHORT_RAMP);
    replay.mfc.channels[1].id = gas_daq::protocol::ChannelId(9);
    replay.experiment.protocol_artifact = original.protocol_path.clone();

    let err = run_session(&replay, &mut MockDeviceProvider::new(), ShutdownSignal::never())
        .await
        .unwrap_err();
    assert!(err.is_build_error());
    assert!(err.to_string().contains("nodes"));
}

#[tokio::test(start_paused = true)]
async fn back_to_back_sessions_keep_separate_files() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), SHORT_RAMP);

    let first = run_session(&config, &mut MockDeviceProvider::new(), ShutdownSignal::never())
        .await
        .unwrap();
    let first_log = first.worker(SOURCE).unwrap().log_path.clone();
    let first_rows = read_log(&first_log, &["timestamp", "value"]);

    let second = run_session(&config, &mut MockDeviceProvider::new(), ShutdownSignal::never())
        .await
        .unwrap();
    assert_eq!(second.outcome(), SessionOutcome::Success);

    for (a, b) in first.workers.iter().zip(&second.workers) {
        assert_ne!(a.log_path, b.log_path);
    }
    assert_ne!(first.protocol_path, second.protocol_path);
    assert_eq!(read_log(&first_log, &["timestamp", "value"]), first_rows);
    assert!(load_protocol(first.protocol_path.as_ref().unwrap()).is_ok());
}
