//! End-to-end session runs against the simulated sensor.

use std::sync::Arc;
use std::time::Duration;

use chr_daq::config::Settings;
use chr_daq::consumer::{AxisLimits, MemorySink};
use chr_daq::pacing::StopSignal;
use chr_daq::protocol::ids::{etr, signal};
use chr_daq::scan::{ScanPlan, ScanState, DEFAULT_OUTPUT_SIGNALS};
use chr_daq::session::{ConnectionState, Consumer, Session};
use chr_daq::sim::{SimControl, SimProfile, SimulatedSensor, UNREACHABLE_ADDRESS};
use chr_daq::trigger_loss::TriggerLossPlan;

async fn connect_with(profile: SimProfile, settings: Settings) -> (Session, SimControl) {
    let sensor = SimulatedSensor::new(profile);
    let control = sensor.control();
    let (session, state) = Session::connect(Arc::new(sensor), settings).await;
    let session = session.expect("Failed to connect to simulated sensor");
    assert_eq!(*state.borrow(), ConnectionState::Connected);
    (session, control)
}

async fn connect() -> (Session, SimControl) {
    connect_with(SimProfile::default(), Settings::default()).await
}

async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_connect_reads_device_settings_and_disconnect_resets() {
    let dir = tempfile::tempdir().unwrap();
    let ini = dir.path().join("driver.ini");
    std::fs::write(&ini, "[connection]\n").unwrap();
    let mut settings = Settings::default();
    settings.connection.ini_file = Some(ini.clone());
    settings.connection.log_dir = Some(dir.path().to_path_buf());

    let (session, control) = connect_with(SimProfile::default(), settings).await;
    assert_eq!(control.ini_file(), Some(ini));
    assert_eq!(control.log_dir(), Some(dir.path().to_path_buf()));

    let device = session.device_settings();
    assert_eq!(device.output_signals, DEFAULT_OUTPUT_SIGNALS.to_vec());
    assert_eq!(device.scan_rate, 2000.0);
    assert_eq!(device.full_scale, 600.0);
    assert_eq!(device.channels, 1);
    // Pull count follows half the scan rate.
    assert_eq!(session.tuning().pull_count(), 1000);
    assert!(session.is_acquiring());

    let state = session.state();
    session.disconnect().await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Reset);
}

#[tokio::test]
async fn test_unreachable_sensor_reports_failed() {
    let mut settings = Settings::default();
    settings.connection.address = UNREACHABLE_ADDRESS.to_string();
    let (session, state) =
        Session::connect(Arc::new(SimulatedSensor::default()), settings).await;
    let err = session.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(*state.borrow(), ConnectionState::Failed);
    assert_eq!(state.borrow().code(), 0);
}

#[tokio::test]
async fn test_acquisition_fault_tears_the_connection_down() {
    let mut settings = Settings::default();
    settings.acquisition.gate_on_consumer = false;
    let (session, control) = connect_with(SimProfile::default(), settings).await;
    let mut state = session.state();
    assert!(control.live_handles() > 0);

    control.fail_next_reads(u32::MAX);
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .expect("fault was not reported")
    .unwrap();

    // Failed is published only after the teardown finished.
    assert!(!session.dispatcher().is_running());
    assert_eq!(control.live_handles(), 0);
    assert!(!session.is_acquiring());
    assert!(!session.is_connected());

    session.disconnect().await.unwrap();
    assert_eq!(*state.borrow(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_closing_peer_disconnects_the_session() {
    let (session, control) = connect().await;
    let mut state = session.state();
    let closing = session.peer_closing();

    control.push_message("closing connection");
    tokio::time::timeout(Duration::from_secs(2), closing.cancelled())
        .await
        .expect("closing message not seen");
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Reset),
    )
    .await
    .expect("session stayed connected")
    .unwrap();

    assert!(!session.dispatcher().is_running());
    assert_eq!(control.live_handles(), 0);
    assert!(!session.is_acquiring());
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_latest_values_are_scaled_to_full_scale() {
    let (session, _control) = connect().await;
    let mut latest = session.latest();
    let values = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let values = latest.changed().await.unwrap();
            if values.distance.is_some() {
                break values;
            }
        }
    })
    .await
    .unwrap();
    let raw = f64::from(values.distance_raw.unwrap());
    let distance = values.distance.unwrap();
    assert!((distance - raw * 600.0 / 32768.0).abs() < 1e-9);
    assert!(values.intensity.is_some());
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_scan_rate_change_retunes_pull_count() {
    let (mut session, _control) = connect().await;
    let mut console = session.take_console().unwrap();

    let rsp = session.query_text("SHZ 4000").await.unwrap();
    assert_eq!(rsp.f64_arg(0).unwrap(), 4000.0);
    let tuning = Arc::clone(session.tuning());
    assert!(eventually(Duration::from_secs(2), || tuning.pull_count() == 2000).await);

    let line = tokio::time::timeout(Duration::from_secs(2), console.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "[Sensor] <<$SHZ 4000.0");
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_sample_rate_monitor_sees_ordered_counters() {
    let mut settings = Settings::default();
    settings.acquisition.gate_on_consumer = false;
    let (mut session, _control) = connect_with(SimProfile::default(), settings).await;

    let sink = MemorySink::new(AxisLimits::new(0.0, 100.0));
    let task = session.spawn_sample_rate_monitor(sink.clone()).unwrap();
    assert!(session.spawn_sample_rate_monitor(sink.clone()).is_err());
    assert!(eventually(Duration::from_secs(3), || sink.snapshot().len() > 500).await);

    let series = sink.snapshot();
    assert!(series.points.windows(2).all(|w| w[1].1 == w[0].1 + 1.0));
    assert!(series.points.windows(2).all(|w| w[1].0 >= w[0].0));
    assert!(sink.limits().high > 100.0);

    session.control(Consumer::SampleRate).stop();
    let (_worker, _exit) = task.await.unwrap();
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_trigger_check_counts_every_position_and_disarms() {
    let (mut session, control) = connect().await;
    let plan = TriggerLossPlan::new(0.0, 100.0, 10.0);

    let report = session
        .run_trigger_check(plan, Duration::from_secs(5), StopSignal::new())
        .await
        .unwrap();
    assert_eq!(report.expected, 11);
    assert_eq!(report.observed, 11);
    assert_eq!(report.lost, 0);
    assert!(report.loss_positions.is_empty());
    assert!(!report.cancelled);
    let positions: Vec<i64> = report.rows.iter().map(|r| r.position).collect();
    assert_eq!(positions, (0..=10).map(|k| k * 10).collect::<Vec<_>>());

    assert_eq!(control.encoder_trigger()[etr::ENABLE as usize], 0.0);
    assert_eq!(control.output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    let seen = control.commands_seen();
    assert!(seen.iter().any(|c| c == "TRE"));
    assert!(seen.iter().any(|c| c == "CTN"));

    let dir = tempfile::tempdir().unwrap();
    let path = report.save(dir.path()).unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("Trigger count should be = 11"));

    // The trigger queue is handed back for the next run.
    let again = session
        .run_trigger_check(plan, Duration::from_secs(5), StopSignal::new())
        .await
        .unwrap();
    assert_eq!(again.observed, 11);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_trigger_check_cancel_and_timeout() {
    let (mut session, control) = connect().await;
    let far = TriggerLossPlan::new(0.0, 1_000_000.0, 1.0);

    let cancel = StopSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.trigger();
    });
    let report = session
        .run_trigger_check(far, Duration::from_secs(10), cancel)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.summary()[0], "[User Cancel]");

    let err = session
        .run_trigger_check(far, Duration::from_millis(300), StopSignal::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(control.encoder_trigger()[etr::ENABLE as usize], 0.0);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_scan_suspends_and_resumes_acquisition() {
    let (mut session, control) = connect().await;
    let mut plan = ScanPlan::new(3, 100);
    plan.poll = Duration::from_millis(10);

    let controller = session.scan_controller(plan);
    let outcome = session.run_scan(controller).await;
    assert_eq!(outcome.state, ScanState::Finished);
    assert_eq!(outcome.result.lines_completed, 3);
    let image = outcome.result.image(signal::DISTANCE_1).unwrap();
    assert_eq!((image.rows, image.columns), (100, 3));

    assert!(session.is_acquiring());
    assert_eq!(control.output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    session.disconnect().await.unwrap();
}
