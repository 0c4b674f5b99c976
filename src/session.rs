//! Connection orchestrator.
//!
//! A [`Session`] owns everything one sensor connection needs:
//!
//! - a blocking link, shared by the acquisition loop and the scan controller;
//! - a non-blocking shared sub-connection run by the async dispatcher;
//! - the three distribution queues and their consumer controls;
//! - the latest-values snapshot and the connection state channel.
//!
//! Connecting runs the driver setup (ini file, logging), opens both links,
//! subscribes the default output signals, snapshots the device settings and
//! starts acquisition. The state channel reports `Connected` then, `Failed`
//! when connecting fails or acquisition faults, and `Reset` after a
//! disconnect or when the device closes the connection.
//!
//! A fault or a closing peer runs the same teardown as
//! [`Session::disconnect`]: consumers stop, acquisition and the dispatcher
//! are joined, the links close, and only then is the final state published.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acquisition::{
    latest_channel, AcquisitionExit, AcquisitionHandle, AcquisitionTaps, AcquisitionTuning,
    AcquisitionWorker, LatestPublisher, LatestReader, TriggerRecord,
};
use crate::config::{period_of, Settings};
use crate::consumer::{
    distribution_queue, AxisLimits, ConsumerControl, ConsumerWorker, CounterAxis, DisplaySink,
    DistanceAxis, SeriesAggregator, WorkerExit,
};
use crate::dispatcher::{AsyncDispatcher, DispatchEvent, DispatcherHandle};
use crate::driver::DeviceLibrary;
use crate::error::{AppResult, DaqError};
use crate::link::{with_link, DeviceLink, SharedLink};
use crate::pacing::StopSignal;
use crate::protocol::ids::{cmd, etr, signal, OperationMode};
use crate::protocol::{Arg, Command, Response};
use crate::scan::{ScanController, ScanOutcome, ScanPlan, DEFAULT_OUTPUT_SIGNALS};
use crate::trigger_loss::{TriggerLossMonitor, TriggerLossPlan, TriggerLossReport};

/// Bound on one dispatcher command issued by the session itself.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Output signals subscribed while verifying triggers.
pub const TRIGGER_CHECK_SIGNALS: [u16; 7] = [
    signal::ENCODER_X,
    signal::ENCODER_Y,
    signal::ENCODER_Z,
    signal::EXPOSURE_FLAGS,
    signal::SAMPLE_COUNTER,
    signal::DISTANCE_1,
    signal::INTENSITY_1,
];

/// Connection state as published to the user interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Open and acquiring.
    Connected,
    /// Opening failed or the connection was lost.
    Failed,
    /// Disconnected, or the address changed.
    Reset,
}

impl ConnectionState {
    /// Numeric form: `1` connected, `0` failed, `-1` reset.
    pub const fn code(self) -> i32 {
        match self {
            ConnectionState::Connected => 1,
            ConnectionState::Failed => 0,
            ConnectionState::Reset => -1,
        }
    }
}

/// Device settings read at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSettings {
    /// Signal ids the device outputs.
    pub output_signals: Vec<u16>,
    /// Sample rate in hertz.
    pub scan_rate: f64,
    /// Light source intensity, in percent.
    pub lamp_intensity: f64,
    /// Measuring range, in micrometres.
    pub full_scale: f64,
    /// Peaks detected per channel.
    pub peaks: i64,
    /// Samples averaged per output sample.
    pub data_average: i64,
    /// Spectra averaged per measurement.
    pub spectrum_average: i64,
    /// Sensor channels.
    pub channels: i64,
    /// Raw intensity treated as saturation.
    pub saturation_level: f64,
}

impl DeviceSettings {
    fn read(link: &mut DeviceLink, saturation_level: f64) -> AppResult<Self> {
        let mut query = |id| link.send(&Command::query(id));
        let output_signals = query(cmd::OUTPUT_SIGNALS)?
            .arg(0)?
            .as_int_list()
            .unwrap_or_default()
            .into_iter()
            .map(|id| id as u16)
            .collect();
        Ok(Self {
            output_signals,
            scan_rate: query(cmd::SCAN_RATE)?.f64_arg(0)?,
            lamp_intensity: query(cmd::LAMP_INTENSITY)?.f64_arg(0)?,
            full_scale: query(cmd::FULL_SCALE)?.f64_arg(0)?,
            peaks: query(cmd::NUMBER_OF_PEAKS)?.i64_arg(0)?,
            data_average: query(cmd::DATA_AVERAGE)?.i64_arg(0)?,
            spectrum_average: query(cmd::SPECTRUM_AVERAGE)?.i64_arg(0)?,
            channels: query(cmd::NUMBER_OF_CHANNELS)?.i64_arg(0)?,
            saturation_level,
        })
    }
}

/// Which way to move the sensor head to get the target back to mid-range.
///
/// `0` inside the band of ±20% around mid-range, `-1` above it, `1` below
/// it, `-2` when nothing is measured.
pub fn focus_hint(distance: f64, full_scale: f64) -> i8 {
    if distance == 0.0 {
        return -2;
    }
    let mid = full_scale / 2.0;
    let band = full_scale * 0.2;
    if distance > mid + band {
        -1
    } else if distance < mid - band {
        1
    } else {
        0
    }
}

/// Consumer queue selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    /// Sample counter plot.
    SampleRate,
    /// Distance plot.
    Distance,
    /// Trigger loss check.
    TriggerLoss,
}

/// Running plot worker.
pub type MonitorTask<A, S> = JoinHandle<(ConsumerWorker<SeriesAggregator<A, S>>, WorkerExit)>;

struct Queues {
    taps: AcquisitionTaps,
    samples: ConsumerControl,
    distance: ConsumerControl,
    trigger: ConsumerControl,
    samples_rx: Option<mpsc::Receiver<Vec<f64>>>,
    distance_rx: Option<mpsc::Receiver<Vec<f64>>>,
    trigger_rx: Option<mpsc::Receiver<TriggerRecord>>,
}

impl Queues {
    fn new(capacity: usize) -> Self {
        let (samples_tap, samples_rx, samples) = distribution_queue("samples", capacity);
        let (distance_tap, distance_rx, distance) = distribution_queue("distance", capacity);
        let (trigger_tap, trigger_rx, trigger) = distribution_queue("trigger", capacity);
        Self {
            taps: AcquisitionTaps {
                samples: Some(samples_tap),
                distance: Some(distance_tap),
                trigger: Some(trigger_tap),
            },
            samples,
            distance,
            trigger,
            samples_rx: Some(samples_rx),
            distance_rx: Some(distance_rx),
            trigger_rx: Some(trigger_rx),
        }
    }
}

/// Why a connection went away without a disconnect request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionLoss {
    Faulted(String),
    PeerClosing,
}

/// Shared shutdown path of one connection. Runs at most once.
struct Teardown {
    address: String,
    link: SharedLink,
    dispatcher: DispatcherHandle,
    acquisition: Arc<parking_lot::Mutex<Option<AcquisitionHandle>>>,
    controls: [ConsumerControl; 3],
    state: Arc<watch::Sender<ConnectionState>>,
    timeout: Duration,
    closed: AtomicBool,
    done: tokio::sync::Mutex<bool>,
}

impl Teardown {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every worker, close both links and publish `final_state`.
    ///
    /// `None` when an earlier call already ran it; a concurrent caller waits
    /// until that call finished.
    async fn run(&self, final_state: ConnectionState) -> Option<AppResult<()>> {
        let mut done = self.done.lock().await;
        if *done {
            return None;
        }
        *done = true;
        self.closed.store(true, Ordering::Release);
        for control in &self.controls {
            control.stop();
        }
        let acquisition = self.acquisition.lock().take();
        if let Some(handle) = acquisition {
            match handle.stop_and_wait(self.timeout).await {
                Ok(exit) => debug!(?exit, "acquisition joined"),
                Err(err) => warn!(error = %err, "acquisition teardown, proceeding"),
            }
        }
        let mut errors = Vec::new();
        if let Err(err) = self.dispatcher.shutdown().await {
            errors.push(err);
        }
        if let Err(err) = with_link(&self.link, |link| link.close()).await {
            errors.push(err);
        }
        self.state.send_replace(final_state);
        info!(address = %self.address, state = ?final_state, "sensor disconnected");
        Some(match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        })
    }
}

/// Tear the connection down on the first loss reported.
async fn supervise(mut losses: mpsc::UnboundedReceiver<ConnectionLoss>, teardown: Arc<Teardown>) {
    let Some(loss) = losses.recv().await else {
        return;
    };
    let final_state = match &loss {
        ConnectionLoss::Faulted(reason) => {
            error!(%reason, "acquisition faulted, connection lost");
            ConnectionState::Failed
        }
        ConnectionLoss::PeerClosing => {
            warn!("device closed the connection");
            ConnectionState::Reset
        }
    };
    if let Some(Err(err)) = teardown.run(final_state).await {
        warn!(error = %err, "teardown after connection loss failed");
    }
}

/// One connected sensor.
pub struct Session {
    settings: Settings,
    link: SharedLink,
    dispatcher: DispatcherHandle,
    tuning: Arc<AcquisitionTuning>,
    acquisition: Arc<parking_lot::Mutex<Option<AcquisitionHandle>>>,
    publisher: LatestPublisher,
    latest: LatestReader,
    queues: Queues,
    device: DeviceSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    console: Option<mpsc::UnboundedReceiver<String>>,
    peer_closing: StopSignal,
    losses: mpsc::UnboundedSender<ConnectionLoss>,
    teardown: Arc<Teardown>,
    pump: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.settings.connection.address)
            .field("state", &*self.state.borrow())
            .field("acquiring", &self.is_acquiring())
            .finish()
    }
}

impl Session {
    /// Connect and start acquisition.
    ///
    /// The returned receiver carries the connection state; it reads `Failed`
    /// if connecting fails.
    pub async fn connect(
        library: Arc<dyn DeviceLibrary>,
        settings: Settings,
    ) -> (AppResult<Self>, watch::Receiver<ConnectionState>) {
        let (state, rx) = watch::channel(ConnectionState::Reset);
        let state = Arc::new(state);
        let result = Self::open(library, settings, Arc::clone(&state)).await;
        match &result {
            Ok(_) => {
                state.send_replace(ConnectionState::Connected);
            }
            Err(err) => {
                error!(error = %err, "connection failed");
                state.send_replace(ConnectionState::Failed);
            }
        }
        (result, rx)
    }

    async fn open(
        library: Arc<dyn DeviceLibrary>,
        settings: Settings,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> AppResult<Self> {
        settings.validate()?;
        let conn = settings.connection.with_mode(OperationMode::Blocking);
        let check = |r: Result<(), i32>| {
            r.map_err(|code| DaqError::transport(code, library.error_string(code)))
        };
        if let Some(ini) = &conn.ini_file {
            check(library.set_ini_file(ini))?;
        }
        if let Some(dir) = &conn.log_dir {
            check(library.configure_logging(dir, conn.log_max_file_kib, conn.log_max_files))?;
        }

        let saturation_level = settings.acquisition.saturation_level;
        let lib = Arc::clone(&library);
        let (blocking, async_link, device) = tokio::task::spawn_blocking(move || {
            let mut blocking = DeviceLink::open(lib, &conn)?;
            let async_link = blocking.open_shared(OperationMode::NonBlocking)?;
            let ids: Vec<Arg> = DEFAULT_OUTPUT_SIGNALS.iter().map(|id| Arg::Int(i32::from(*id))).collect();
            blocking.send(&Command::with_args(cmd::OUTPUT_SIGNALS, ids))?;
            let device = DeviceSettings::read(&mut blocking, saturation_level)?;
            blocking.flush()?;
            Ok::<_, DaqError>((blocking, async_link, device))
        })
        .await
        .map_err(|e| DaqError::State(format!("connect task failed: {e}")))??;
        info!(
            address = %settings.connection.address,
            scan_rate = device.scan_rate,
            full_scale = device.full_scale,
            "sensor connected"
        );

        let (dispatcher, events) = AsyncDispatcher::spawn(async_link, &settings.acquisition)?;
        let tuning = Arc::new(AcquisitionTuning::new(
            settings.acquisition.default_pull_count,
            device.full_scale,
        ));
        tuning.follow_scan_rate(device.scan_rate);
        let (console_tx, console_rx) = mpsc::unbounded_channel();
        let (losses, losses_rx) = mpsc::unbounded_channel();
        let peer_closing = StopSignal::new();
        let pump = tokio::spawn(pump_events(
            events,
            console_tx,
            Arc::clone(&tuning),
            peer_closing.clone(),
            losses.clone(),
        ));
        let (publisher, latest) = latest_channel();
        let queues = Queues::new(settings.acquisition.queue_capacity);
        let link = Arc::new(parking_lot::Mutex::new(blocking));
        let acquisition = Arc::new(parking_lot::Mutex::new(None));
        let teardown = Arc::new(Teardown {
            address: settings.connection.address.clone(),
            link: Arc::clone(&link),
            dispatcher: dispatcher.clone(),
            acquisition: Arc::clone(&acquisition),
            controls: [
                queues.samples.clone(),
                queues.distance.clone(),
                queues.trigger.clone(),
            ],
            state: Arc::clone(&state),
            timeout: settings.acquisition.teardown_timeout,
            closed: AtomicBool::new(false),
            done: tokio::sync::Mutex::new(false),
        });
        let supervisor = tokio::spawn(supervise(losses_rx, Arc::clone(&teardown)));

        let mut session = Self {
            settings,
            link,
            dispatcher,
            tuning,
            acquisition,
            publisher,
            latest,
            queues,
            device,
            state,
            console: Some(console_rx),
            peer_closing,
            losses,
            teardown,
            pump,
            supervisor,
        };
        session.start_acquisition();
        Ok(session)
    }

    /// Settings the session was opened with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Values read from the device at connect time.
    pub fn device_settings(&self) -> &DeviceSettings {
        &self.device
    }

    /// Follow the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Newest acquired values.
    pub fn latest(&self) -> LatestReader {
        self.latest.clone()
    }

    /// Live acquisition parameters.
    pub fn tuning(&self) -> &Arc<AcquisitionTuning> {
        &self.tuning
    }

    /// Command submission on the non-blocking link.
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Rendered console lines. Can be taken once.
    pub fn take_console(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.console.take()
    }

    /// Fires when the device announced it is closing the connection.
    pub fn peer_closing(&self) -> StopSignal {
        self.peer_closing.clone()
    }

    /// Switch for one consumer queue.
    pub fn control(&self, consumer: Consumer) -> &ConsumerControl {
        match consumer {
            Consumer::SampleRate => &self.queues.samples,
            Consumer::Distance => &self.queues.distance,
            Consumer::TriggerLoss => &self.queues.trigger,
        }
    }

    /// The acquisition worker is running.
    pub fn is_acquiring(&self) -> bool {
        self.acquisition.lock().as_ref().is_some_and(|a| !a.is_finished())
    }

    /// `false` once the connection was torn down, whatever the cause.
    pub fn is_connected(&self) -> bool {
        !self.teardown.is_closed()
    }

    // ===== Commands =====

    /// Queue console text on the dispatcher. The response shows up on the
    /// console channel.
    pub async fn exec_text(&self, text: &str) -> AppResult<()> {
        self.dispatcher.submit_text(text).await.map(|_| ())
    }

    /// Issue console text and wait for its response.
    pub async fn query_text(&self, text: &str) -> AppResult<Response> {
        self.dispatcher.query(Command::parse(text)?, COMMAND_TIMEOUT).await
    }

    /// Execute on the blocking link.
    pub async fn exec_blocking(&self, command: Command) -> AppResult<Response> {
        with_link(&self.link, move |link| link.send(&command)).await
    }

    async fn issue(&self, command: Command) -> AppResult<Response> {
        self.dispatcher.query(command, COMMAND_TIMEOUT).await
    }

    // ===== Acquisition =====

    fn start_acquisition(&mut self) {
        if self.is_acquiring() || !self.is_connected() {
            return;
        }
        let worker = AcquisitionWorker::new(
            Arc::clone(&self.link),
            &self.settings.acquisition,
            Arc::clone(&self.tuning),
            self.queues.taps.clone(),
            self.publisher.clone(),
        );
        let losses = self.losses.clone();
        let handle = worker.spawn_with(move |exit| {
            if let AcquisitionExit::Faulted(err) = exit {
                let _ = losses.send(ConnectionLoss::Faulted(err.to_string()));
            }
        });
        *self.acquisition.lock() = Some(handle);
    }

    /// Stop acquisition, bounded by the teardown timeout. A timeout is
    /// logged and the loop abandoned.
    async fn stop_acquisition(&mut self) {
        let Some(handle) = self.acquisition.lock().take() else {
            return;
        };
        match handle.stop_and_wait(self.settings.acquisition.teardown_timeout).await {
            Ok(exit) => debug!(?exit, "acquisition joined"),
            Err(err) => warn!(error = %err, "acquisition teardown, proceeding"),
        }
    }

    // ===== Plot consumers =====

    /// Start the sample-counter plot worker.
    pub fn spawn_sample_rate_monitor<S: DisplaySink>(
        &mut self,
        sink: S,
    ) -> AppResult<MonitorTask<CounterAxis, S>> {
        let rx = self
            .queues
            .samples_rx
            .take()
            .ok_or_else(|| DaqError::State("sample-rate monitor already running".into()))?;
        let acq = &self.settings.acquisition;
        let aggregator = SeriesAggregator::new(CounterAxis, sink, acq.retention_window, acq.trim_fraction);
        let control = self.queues.samples.clone();
        let worker = ConsumerWorker::new(
            "samples",
            rx,
            aggregator,
            control.clone(),
            period_of(acq.sample_rate_plot_hz),
        );
        control.start();
        Ok(tokio::spawn(worker.run()))
    }

    /// Start the distance plot worker.
    pub fn spawn_distance_monitor<S: DisplaySink>(
        &mut self,
        sink: S,
    ) -> AppResult<MonitorTask<DistanceAxis, S>> {
        let rx = self
            .queues
            .distance_rx
            .take()
            .ok_or_else(|| DaqError::State("distance monitor already running".into()))?;
        let acq = &self.settings.acquisition;
        let axis = DistanceAxis {
            full_scale: self.device.full_scale,
        };
        let aggregator = SeriesAggregator::new(axis, sink, acq.retention_window, acq.trim_fraction);
        let control = self.queues.distance.clone();
        let worker = ConsumerWorker::new(
            "distance",
            rx,
            aggregator,
            control.clone(),
            period_of(acq.distance_plot_hz),
        )
        .wait_for_data(true);
        control.start();
        Ok(tokio::spawn(worker.run()))
    }

    /// Initial limits for a distance plot.
    pub fn distance_limits(&self) -> AxisLimits {
        AxisLimits::new(-20.0, self.device.full_scale + 10.0)
    }

    // ===== Trigger-loss verification =====

    /// Verify encoder triggers until the stop position, `cancel` or `limit`.
    ///
    /// A user cancel yields a report marked cancelled. Running out of time
    /// fails with [`DaqError::Timeout`]. The device is disarmed either way.
    pub async fn run_trigger_check(
        &mut self,
        plan: TriggerLossPlan,
        limit: Duration,
        cancel: StopSignal,
    ) -> AppResult<TriggerLossReport> {
        plan.validate()?;
        let mut rx = self
            .queues
            .trigger_rx
            .take()
            .ok_or_else(|| DaqError::State("trigger check already running".into()))?;
        if let Err(err) = self.arm_trigger_check(&plan).await {
            self.queues.trigger_rx = Some(rx);
            self.disarm_trigger_check().await;
            return Err(err);
        }
        while rx.try_recv().is_ok() {}

        let control = self.queues.trigger.clone();
        let stop = StopSignal::new();
        let (monitor, _progress) = TriggerLossMonitor::new(plan);
        let worker = ConsumerWorker::new(
            "trigger",
            rx,
            monitor,
            control.clone(),
            period_of(self.settings.acquisition.trigger_verify_hz),
        )
        .wait_for_data(true)
        .with_stop(stop.clone());
        control.start();
        let enabled = self
            .issue(Command::new(cmd::ENCODER_TRIGGER).arg(etr::ENABLE).arg(1))
            .await;

        let mut task = tokio::spawn(worker.run());
        let mut timed_out = false;
        // Nothing else consumes the latest values while verifying; release
        // each read so gated acquisition keeps pulling.
        let mut latest = self.latest.clone();
        let release = async move {
            latest.take();
            while latest.changed().await.is_ok() {}
            std::future::pending::<()>().await;
        };
        let joined = match enabled {
            Err(err) => {
                warn!(error = %err, "encoder trigger did not arm");
                None
            }
            Ok(_) => tokio::select! {
                joined = &mut task => Some(joined),
                _ = tokio::time::sleep(limit) => {
                    timed_out = true;
                    None
                }
                _ = cancel.cancelled() => None,
                _ = release => None,
            },
        };
        let joined = match joined {
            Some(joined) => joined,
            None => {
                stop.trigger();
                (&mut task).await
            }
        };
        control.stop();
        self.disarm_trigger_check().await;

        let (worker, exit) =
            joined.map_err(|e| DaqError::State(format!("trigger verifier failed: {e}")))?;
        let (rx, monitor) = worker.into_parts();
        self.queues.trigger_rx = Some(rx);
        if timed_out {
            return Err(DaqError::Timeout(format!(
                "trigger verification did not reach the stop position within {limit:?}"
            )));
        }
        let report = monitor.report(self.device.scan_rate, exit != WorkerExit::Finished);
        for line in report.summary() {
            info!("{line}");
        }
        Ok(report)
    }

    async fn arm_trigger_check(&self, plan: &TriggerLossPlan) -> AppResult<()> {
        let ids = TRIGGER_CHECK_SIGNALS.iter().map(|id| Arg::Int(i32::from(*id)));
        self.issue(Command::with_args(cmd::OUTPUT_SIGNALS, ids)).await?;
        self.issue(Command::new(cmd::TRIGGER_EACH)).await?;
        let etr_set = |index: i32, value: f64| Command::new(cmd::ENCODER_TRIGGER).arg(index).arg(value);
        self.issue(etr_set(etr::AXIS, plan.axis as f64)).await?;
        self.issue(etr_set(etr::START, plan.start)).await?;
        self.issue(etr_set(etr::STOP, plan.stop)).await?;
        self.issue(etr_set(etr::INTERVAL, plan.interval)).await?;
        self.issue(etr_set(etr::ON_RETURN, f64::from(u8::from(plan.on_return))))
            .await?;
        Ok(())
    }

    async fn disarm_trigger_check(&self) {
        let ids = DEFAULT_OUTPUT_SIGNALS.iter().map(|id| Arg::Int(i32::from(*id)));
        let steps = [
            Command::new(cmd::ENCODER_TRIGGER).arg(etr::ENABLE).arg(0),
            Command::new(cmd::TRIGGER_CONTINUOUS),
            Command::with_args(cmd::OUTPUT_SIGNALS, ids),
        ];
        for command in steps {
            let id = command.id();
            if let Err(err) = self.issue(command).await {
                warn!(command = %id, error = %err, "trigger check disarm step failed");
            }
        }
    }

    // ===== Raster scan =====

    /// Controller for `plan` on this session's blocking link. Take its abort
    /// signal and state before handing it to [`run_scan`](Self::run_scan).
    pub fn scan_controller(&self, plan: ScanPlan) -> ScanController {
        ScanController::new(Arc::clone(&self.link), plan)
    }

    /// Run a scan with acquisition suspended, then resume acquisition.
    pub async fn run_scan(&mut self, controller: ScanController) -> ScanOutcome {
        info!("raster scan starting");
        self.stop_acquisition().await;
        let outcome = controller.run().await;
        if let Err(err) = with_link(&self.link, |link| link.flush()).await {
            warn!(error = %err, "flush after scan failed");
        }
        self.start_acquisition();
        info!(state = ?outcome.state, "trigger scan done");
        outcome
    }

    // ===== Teardown =====

    /// Stop every worker and close both links.
    ///
    /// After a fault or a closing peer already tore the connection down this
    /// only releases the session; the published state stays as it was.
    pub async fn disconnect(self) -> AppResult<()> {
        let result = self.teardown.run(ConnectionState::Reset).await;
        self.pump.abort();
        self.supervisor.abort();
        result.unwrap_or(Ok(()))
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<DispatchEvent>,
    console: mpsc::UnboundedSender<String>,
    tuning: Arc<AcquisitionTuning>,
    peer_closing: StopSignal,
    losses: mpsc::UnboundedSender<ConnectionLoss>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Console(line) => {
                info!(target: "chr_daq::console", "{line}");
                let _ = console.send(line);
            }
            DispatchEvent::ScanRate(hz) => {
                tuning.follow_scan_rate(hz);
                debug!(hz, pull_count = tuning.pull_count(), "scan rate changed");
            }
            DispatchEvent::Response(response) => {
                debug!(command = %response.command_id, ticket = response.ticket.0, "unsolicited response");
            }
            DispatchEvent::Samples(batch) => {
                debug!(samples = batch.sample_count, "non-blocking sample block");
            }
            DispatchEvent::PeerClosing => {
                warn!("device is closing the connection");
                peer_closing.trigger();
                let _ = losses.send(ConnectionLoss::PeerClosing);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_hint_bands() {
        assert_eq!(focus_hint(0.0, 600.0), -2);
        assert_eq!(focus_hint(300.0, 600.0), 0);
        assert_eq!(focus_hint(419.0, 600.0), 0);
        assert_eq!(focus_hint(421.0, 600.0), -1);
        assert_eq!(focus_hint(100.0, 600.0), 1);
    }

    #[test]
    fn test_connection_state_codes() {
        assert_eq!(ConnectionState::Connected.code(), 1);
        assert_eq!(ConnectionState::Failed.code(), 0);
        assert_eq!(ConnectionState::Reset.code(), -1);
    }
}
