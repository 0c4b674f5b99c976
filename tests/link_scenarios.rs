//! Driver link behavior against the simulated sensor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chr_daq::config::{AcquisitionSettings, ConnectionConfig};
use chr_daq::decoder::SampleDecoder;
use chr_daq::dispatcher::AsyncDispatcher;
use chr_daq::link::DeviceLink;
use chr_daq::protocol::ids::{cmd, signal, AutoBufferStatus, OperationMode, ReadStatus};
use chr_daq::protocol::Command;
use chr_daq::sim::{simulated_distance_raw, SimProfile, SimulatedSensor};

fn blocking_link(sensor: &SimulatedSensor) -> DeviceLink {
    DeviceLink::open(Arc::new(sensor.clone()), &ConnectionConfig::default())
        .expect("Failed to open simulated link")
}

#[test]
fn test_scan_rate_set_then_queried() {
    let sensor = SimulatedSensor::new(SimProfile {
        scan_rate: 4000.0,
        ..SimProfile::default()
    });
    let mut link = blocking_link(&sensor);

    let set = link.send_text("SHZ 2000").unwrap();
    assert_eq!(set.f64_arg(0).unwrap(), 2000.0);
    let rsp = link.send(&Command::query(cmd::SCAN_RATE)).unwrap();
    assert!(rsp.flags.is_query());
    assert_eq!(rsp.f64_arg(0).unwrap(), 2000.0);
    link.close().unwrap();
}

#[test]
fn test_unknown_command_is_transport_error() {
    let sensor = SimulatedSensor::default();
    let mut link = blocking_link(&sensor);
    let err = link.send_text("XYZ").unwrap_err();
    assert!(err.is_transport());
    assert!(err.to_string().contains("unknown command"));
}

#[test]
fn test_counter_only_catalog_sizes_auto_buffer() {
    let sensor = SimulatedSensor::new(SimProfile {
        auto_fill_per_poll: 64,
        ..SimProfile::default()
    });
    let mut link = blocking_link(&sensor);
    link.send(&Command::new(cmd::OUTPUT_SIGNALS).arg(i32::from(signal::SAMPLE_COUNTER)))
        .unwrap();
    let ids: Vec<u16> = link.catalog().signals().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![signal::SAMPLE_COUNTER]);

    let len = link.activate_auto_buffer(500, true).unwrap();
    assert_eq!(len, 1000);

    let batch = link.new_auto_buffer_samples().unwrap().expect("first fill");
    assert_eq!(batch.sample_count, 64);
    let decoded = SampleDecoder::new().decode(&batch).unwrap();
    let counters = decoded.first_channel(signal::SAMPLE_COUNTER).unwrap();
    assert_eq!(counters, (0..64).map(f64::from).collect::<Vec<_>>());

    link.deactivate_auto_buffer().unwrap();
    assert!(!link.auto_buffer_active());
    // Already inactive.
    link.deactivate_auto_buffer().unwrap();
}

#[test]
fn test_auto_buffer_size_query_error_is_surfaced() {
    let sensor = SimulatedSensor::default();
    let mut link = blocking_link(&sensor);
    sensor.control().fail_size_query(true);
    let err = link.activate_auto_buffer(100, false).unwrap_err();
    assert!(err.is_transport());
    assert!(!link.auto_buffer_active());
}

#[test]
fn test_auto_buffer_error_status_fails_the_fetch() {
    let sensor = SimulatedSensor::new(SimProfile {
        auto_fill_per_poll: 8,
        ..SimProfile::default()
    });
    let mut link = blocking_link(&sensor);
    link.activate_auto_buffer(100, true).unwrap();
    assert!(link.new_auto_buffer_samples().unwrap().is_some());

    sensor.control().fail_auto_buffer(true);
    assert_eq!(link.auto_buffer_status().unwrap(), AutoBufferStatus::Error);
    let err = link.new_auto_buffer_samples().unwrap_err();
    assert!(err.is_transport());

    sensor.control().fail_auto_buffer(false);
    assert!(link.new_auto_buffer_samples().unwrap().is_some());
}

#[test]
fn test_format_change_rebuilds_layout_without_touching_earlier_batches() {
    let sensor = SimulatedSensor::new(SimProfile {
        samples_per_pull: Some(10),
        ..SimProfile::default()
    });
    let mut link = blocking_link(&sensor);
    sensor
        .control()
        .schedule_format_change(10, vec![signal::SAMPLE_COUNTER]);

    let mut decoder = SampleDecoder::new();
    let mut earlier = Vec::new();
    for _ in 0..9 {
        let batch = link.pull_samples(100, false).unwrap().expect("samples");
        assert_eq!(batch.status, ReadStatus::Success);
        earlier.push(decoder.decode(&batch).unwrap());
    }
    assert_eq!(decoder.rebuilds(), 1);

    let batch = link.pull_samples(100, false).unwrap().expect("samples");
    assert_eq!(batch.status, ReadStatus::FormatChange);
    let changed = decoder.decode(&batch).unwrap();
    assert_eq!(decoder.rebuilds(), 2);
    assert!(!changed.contains(signal::DISTANCE_1));
    assert_eq!(changed.value(signal::SAMPLE_COUNTER, 0).unwrap(), 90.0);

    // Batches decoded before the change keep their own layout.
    assert_eq!(
        earlier[0].value(signal::DISTANCE_1, 3).unwrap(),
        f64::from(simulated_distance_raw(3, 0))
    );
    assert_eq!(earlier[8].value(signal::SAMPLE_COUNTER, 9).unwrap(), 89.0);
}

#[test]
fn test_failed_read_retries_after_flush() {
    let sensor = SimulatedSensor::new(SimProfile {
        samples_per_pull: Some(5),
        ..SimProfile::default()
    });
    let mut link = blocking_link(&sensor);
    sensor.control().fail_next_reads(1);
    let batch = link.pull_samples(100, true).unwrap().expect("retried read");
    assert_eq!(batch.sample_count, 5);
    assert_eq!(sensor.control().reads(), 2);

    sensor.control().fail_next_reads(1);
    assert!(link.pull_samples(100, false).unwrap_err().is_transport());
}

#[tokio::test]
async fn test_shutdown_times_out_on_unanswered_command() {
    let sensor = SimulatedSensor::default();
    let config = ConnectionConfig {
        mode: OperationMode::NonBlocking,
        close_timeout: Duration::from_millis(300),
        close_poll: Duration::from_millis(20),
        ..ConnectionConfig::default()
    };
    let link = DeviceLink::open(Arc::new(sensor.clone()), &config).unwrap();
    let (handle, _events) = AsyncDispatcher::spawn(link, &AcquisitionSettings::default()).unwrap();

    sensor.control().mute(cmd::LAMP_INTENSITY);
    handle
        .submit(Command::query(cmd::LAMP_INTENSITY), None)
        .await
        .unwrap();

    let started = Instant::now();
    let err = handle.shutdown().await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_muted_query_times_out_at_caller() {
    let sensor = SimulatedSensor::default();
    let config = ConnectionConfig::default().with_mode(OperationMode::NonBlocking);
    let link = DeviceLink::open(Arc::new(sensor.clone()), &config).unwrap();
    let (handle, _events) = AsyncDispatcher::spawn(link, &AcquisitionSettings::default()).unwrap();

    sensor.control().mute(cmd::FULL_SCALE);
    let err = handle
        .query(Command::query(cmd::FULL_SCALE), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Other commands still resolve.
    let rsp = handle
        .query(Command::query(cmd::SCAN_RATE), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(rsp.f64_arg(0).unwrap(), 2000.0);
}
