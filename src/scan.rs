//! Raster scan over the auto buffer.
//!
//! ```text
//! Idle -> Armed -> (activate buffer -> drain -> deactivate) x lines -> Finished | Aborted | Failed
//! ```
//!
//! The controller arms the device on the blocking link, captures each line
//! into an auto buffer sized for one line and assembles one image per peak
//! signal, indexed `[sample][line * channels + channel]`. Global signals are
//! concatenated across lines. Whatever happens, the closing sequence
//! deactivates the buffer and restores the regular output signals before the
//! terminal state is published. Stopping and restarting the acquisition loop
//! around a scan is up to the caller ([`crate::session::Session::run_scan`]).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::acquisition::distance_um;
use crate::decoder::{SampleBatch, SampleDecoder};
use crate::error::{AppResult, DaqError};
use crate::link::{with_link, SharedLink};
use crate::pacing::StopSignal;
use crate::protocol::ids::{cmd, etr, signal};
use crate::protocol::{Arg, Command};
use crate::signal::SignalCatalog;

/// Output signals of regular acquisition.
pub const DEFAULT_OUTPUT_SIGNALS: [u16; 3] =
    [signal::SAMPLE_COUNTER, signal::DISTANCE_1, signal::INTENSITY_1];

/// Saturation map value for a negative (saturated) intensity.
pub const SATURATED: f64 = 999.0;

/// How samples of a line are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScanTrigger {
    /// Device keeps its current trigger mode; each line is `samples_per_line`
    /// consecutive samples.
    FreeRun,
    /// One sample per encoder position from `start` to `stop`.
    Encoder {
        /// Encoder axis, 0 to 4.
        axis: usize,
        /// First trigger position.
        start: f64,
        /// Last trigger position.
        stop: f64,
        /// Distance between trigger positions.
        interval: f64,
    },
}

/// Parameters snapshot of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Lines in the raster.
    pub lines: usize,
    /// Samples captured per line.
    pub samples_per_line: usize,
    /// Peaks to capture, 1 to 4.
    pub peaks: usize,
    /// How samples are triggered.
    pub trigger: ScanTrigger,
    /// Raw intensity mapped to 100% in the intensity images.
    pub saturation_level: f64,
    /// Build the saturation map.
    pub highlight_saturation: bool,
    /// Pixel pitch along a line and between lines.
    pub dx: f64,
    /// Pitch between lines.
    pub dy: f64,
    /// Pause between auto buffer polls.
    pub poll: Duration,
    /// Longest wait for one line to fill before the scan fails.
    pub line_timeout: Duration,
}

impl ScanPlan {
    /// Free-run plan with one peak and default pacing.
    pub fn new(lines: usize, samples_per_line: usize) -> Self {
        Self {
            lines,
            samples_per_line,
            peaks: 1,
            trigger: ScanTrigger::FreeRun,
            saturation_level: 4095.0,
            highlight_saturation: false,
            dx: 2.0,
            dy: 2.0,
            poll: Duration::from_millis(250),
            line_timeout: Duration::from_secs(60),
        }
    }

    /// Reject plans that cannot run.
    pub fn validate(&self) -> AppResult<()> {
        if self.lines == 0 || self.samples_per_line == 0 {
            return Err(DaqError::Configuration(
                "scan needs at least one line and one sample per line".into(),
            ));
        }
        if self.saturation_level <= 0.0 {
            return Err(DaqError::Configuration("saturation level must be positive".into()));
        }
        if self.line_timeout.is_zero() {
            return Err(DaqError::Configuration("line timeout must be positive".into()));
        }
        if let ScanTrigger::Encoder { axis, interval, .. } = self.trigger {
            if signal::encoder(axis).is_none() {
                return Err(DaqError::Configuration(format!("encoder axis {axis} out of range")));
            }
            if interval <= 0.0 {
                return Err(DaqError::Configuration("encoder interval must be positive".into()));
            }
        }
        Ok(())
    }

    fn peak_count(&self) -> u16 {
        self.peaks.clamp(1, usize::from(signal::MAX_PEAKS)) as u16
    }

    /// Output signal subscription for this scan.
    pub fn output_signals(&self) -> Vec<u16> {
        let mut ids = Vec::new();
        if let ScanTrigger::Encoder { axis, .. } = self.trigger {
            ids.extend(signal::encoder(axis));
        }
        ids.push(signal::SAMPLE_COUNTER);
        for peak in 0..self.peak_count() {
            ids.push(signal::distance(peak));
            ids.push(signal::intensity(peak));
        }
        ids
    }
}

/// Where a scan is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    /// Not started.
    Idle,
    /// Device configured, no line captured yet.
    Armed,
    /// Filling the given line.
    Line(usize),
    /// Every line captured.
    Finished,
    /// Stopped on request.
    Aborted,
    /// Stopped by an error.
    Failed(String),
}

impl ScanState {
    /// Finished, aborted or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Finished | ScanState::Aborted | ScanState::Failed(_))
    }
}

/// Progress pushed while a line fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanUpdate {
    /// Line being filled.
    pub line: usize,
    /// Samples collected for it so far.
    pub samples_in_line: usize,
}

/// One signal's 2-D image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanImage {
    /// Signal id.
    pub id: u16,
    /// Display name.
    pub name: String,
    /// Unit of the values.
    pub unit: &'static str,
    /// Samples per line.
    pub rows: usize,
    /// Lines times channels.
    pub columns: usize,
    /// Channels per line.
    pub channels: usize,
    /// Row-major `[sample][line * channels + channel]`.
    pub data: Vec<f64>,
}

impl ScanImage {
    fn new(id: u16, name: String, unit: &'static str, rows: usize, lines: usize, channels: usize) -> Self {
        let columns = lines * channels;
        Self {
            id,
            name,
            unit,
            rows,
            columns,
            channels,
            data: vec![f64::NAN; rows * columns],
        }
    }

    /// One pixel, `None` outside the image.
    pub fn value(&self, sample: usize, line: usize, channel: usize) -> Option<f64> {
        if sample >= self.rows || channel >= self.channels {
            return None;
        }
        self.data
            .get(sample * self.columns + line * self.channels + channel)
            .copied()
    }

    /// Values of one line, `[sample][channel]`.
    pub fn line(&self, line: usize) -> AppResult<Vec<f64>> {
        if line * self.channels >= self.columns {
            return Err(DaqError::InvalidSampleNumber {
                index: line,
                count: self.columns / self.channels.max(1),
            });
        }
        let mut out = Vec::with_capacity(self.rows * self.channels);
        for sample in 0..self.rows {
            let at = sample * self.columns + line * self.channels;
            out.extend_from_slice(&self.data[at..at + self.channels]);
        }
        Ok(out)
    }

    fn put(&mut self, sample: usize, line: usize, row: &[f64]) {
        if sample >= self.rows {
            return;
        }
        let at = sample * self.columns + line * self.channels;
        for (c, v) in row.iter().take(self.channels).enumerate() {
            self.data[at + c] = *v;
        }
    }
}

/// Display name and unit of a peak signal.
pub fn describe(id: u16) -> (String, &'static str) {
    let n = signal::peak_number(id).unwrap_or(0);
    if signal::is_distance(id) {
        (format!("Distance {n}"), "um")
    } else if signal::is_intensity(id) {
        (format!("Intensity {n}"), "%")
    } else {
        (format!("Signal {id}"), "")
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Intensity in percent of saturation, sign bit stripped.
pub fn intensity_percent(raw: f64, saturation_level: f64) -> f64 {
    let magnitude = (raw as i16 as u16 & 0x7FFF) as f64;
    round3(magnitude / saturation_level * 100.0)
}

/// Saturation map value: percent of the signed raw value, saturated below 0.
pub fn saturation_percent(raw: f64, saturation_level: f64) -> f64 {
    let pct = round3(raw / saturation_level * 100.0);
    if pct < 0.0 {
        SATURATED
    } else {
        pct
    }
}

/// Assembled scan data.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    /// Plan the scan ran with.
    pub plan: ScanPlan,
    /// Sensor channels.
    pub channel_count: usize,
    /// Measuring range used to scale distances.
    pub full_scale: f64,
    /// Per-channel images keyed by signal id.
    pub images: BTreeMap<u16, ScanImage>,
    /// Saturation map of the first intensity signal.
    pub saturation: Option<ScanImage>,
    /// Global signals, one value per sample.
    pub globals: BTreeMap<u16, Vec<f64>>,
    /// Lines fully captured.
    pub lines_completed: usize,
    /// Wall time of the whole run.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ScanResult {
    fn new(plan: ScanPlan) -> Self {
        Self {
            plan,
            channel_count: 0,
            full_scale: 0.0,
            images: BTreeMap::new(),
            saturation: None,
            globals: BTreeMap::new(),
            lines_completed: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Image of signal `id`.
    pub fn image(&self, id: u16) -> AppResult<&ScanImage> {
        self.images.get(&id).ok_or(DaqError::InvalidSignalId(id))
    }

    /// Ids that have an image.
    pub fn peak_ids(&self) -> Vec<u16> {
        self.images.keys().copied().collect()
    }

    /// Values of global signal `id`.
    pub fn global(&self, id: u16) -> AppResult<&[f64]> {
        self.globals
            .get(&id)
            .map(Vec::as_slice)
            .ok_or(DaqError::InvalidSignalId(id))
    }

    /// Samples in the completed lines.
    pub fn total_samples(&self) -> usize {
        self.lines_completed * self.plan.samples_per_line
    }
}

/// Terminal state plus the data gathered up to it.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// How the scan ended.
    pub state: ScanState,
    /// Data captured up to that point.
    pub result: ScanResult,
}

/// Runs one raster scan on a blocking link.
pub struct ScanController {
    link: SharedLink,
    plan: ScanPlan,
    abort: StopSignal,
    state: watch::Sender<ScanState>,
    updates: Option<mpsc::Sender<ScanUpdate>>,
    decoder: SampleDecoder,
}

impl ScanController {
    /// Controller for `plan`, idle until [`run`](Self::run).
    pub fn new(link: SharedLink, plan: ScanPlan) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            link,
            plan,
            abort: StopSignal::new(),
            state,
            updates: None,
            decoder: SampleDecoder::new(),
        }
    }

    /// Push a [`ScanUpdate`] after every poll that produced samples.
    pub fn with_updates(mut self, updates: mpsc::Sender<ScanUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Trigger to abort after the current poll.
    pub fn abort_signal(&self) -> StopSignal {
        self.abort.clone()
    }

    /// Follow the scan state.
    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ScanState) {
        info!(?state, "scan state");
        self.state.send_replace(state);
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        with_link(&self.link, move |link| link.send(&command).map(|_| ())).await
    }

    /// Run to a terminal state. Errors end the scan in [`ScanState::Failed`].
    pub async fn run(mut self) -> ScanOutcome {
        let started = Instant::now();
        let mut result = ScanResult::new(self.plan.clone());
        if let Err(err) = self.plan.validate() {
            warn!(error = %err, "scan plan rejected");
            let state = ScanState::Failed(err.to_string());
            self.set_state(state.clone());
            return ScanOutcome { state, result };
        }
        let mut state = match self.arm(&mut result).await {
            Ok(catalog) => {
                self.set_state(ScanState::Armed);
                match self.capture(&catalog, &mut result).await {
                    Ok(true) => ScanState::Finished,
                    Ok(false) => ScanState::Aborted,
                    Err(err) => ScanState::Failed(err.to_string()),
                }
            }
            Err(err) => ScanState::Failed(err.to_string()),
        };
        if let Err(err) = self.close().await {
            if !matches!(state, ScanState::Failed(_)) {
                state = ScanState::Failed(err.to_string());
            }
        }
        if let ScanState::Failed(reason) = &state {
            warn!(%reason, "scan failed");
        }
        result.elapsed = started.elapsed();
        info!(
            samples = result.total_samples(),
            elapsed = ?result.elapsed,
            "scan collected samples"
        );
        self.set_state(state.clone());
        ScanOutcome { state, result }
    }

    async fn arm(&self, result: &mut ScanResult) -> AppResult<Arc<SignalCatalog>> {
        self.send(Command::new(cmd::STOP_DATA_STREAM)).await?;
        let peaks = i32::from(self.plan.peak_count());
        self.send(Command::new(cmd::NUMBER_OF_PEAKS).arg(peaks)).await?;
        let ids: Vec<i32> = self.plan.output_signals().into_iter().map(i32::from).collect();
        self.send(Command::with_args(cmd::OUTPUT_SIGNALS, ids.into_iter().map(Arg::Int)))
            .await?;
        if let ScanTrigger::Encoder {
            start, stop, interval, axis, ..
        } = self.plan.trigger
        {
            let etr_set =
                |index: i32, value: f64| Command::new(cmd::ENCODER_TRIGGER).arg(index).arg(value);
            self.send(etr_set(etr::AXIS, axis as f64)).await?;
            self.send(etr_set(etr::START, start)).await?;
            self.send(etr_set(etr::INTERVAL, interval)).await?;
            self.send(etr_set(etr::STOP, stop)).await?;
            self.send(etr_set(etr::ENABLE, 1.0)).await?;
        }
        self.send(Command::new(cmd::START_DATA_STREAM)).await?;
        let (catalog, full_scale) = with_link(&self.link, |link| {
            let catalog = link.output_signal_infos()?;
            let full_scale = link.send(&Command::query(cmd::FULL_SCALE))?.f64_arg(0)?;
            Ok((catalog, full_scale))
        })
        .await?;
        result.full_scale = full_scale;
        result.channel_count = catalog.channel_count().max(1);
        Ok(catalog)
    }

    /// Returns `false` when aborted.
    async fn capture(&mut self, catalog: &SignalCatalog, result: &mut ScanResult) -> AppResult<bool> {
        let per_line = self.plan.samples_per_line;
        let lines = self.plan.lines;
        let channels = result.channel_count;
        for peak in catalog.peak_signals() {
            let (name, unit) = describe(peak.id);
            result
                .images
                .insert(peak.id, ScanImage::new(peak.id, name, unit, per_line, lines, channels));
        }
        if self.plan.highlight_saturation {
            if let Some(first) = catalog.peak_signals().iter().find(|s| signal::is_intensity(s.id)) {
                result.saturation = Some(ScanImage::new(
                    first.id,
                    "Saturation".to_string(),
                    "%",
                    per_line,
                    lines,
                    channels,
                ));
            }
        }
        for global in catalog.global_signals() {
            result.globals.insert(global.id, Vec::with_capacity(per_line * lines));
        }

        for line in 0..lines {
            if self.abort.is_set() {
                return Ok(false);
            }
            self.set_state(ScanState::Line(line));
            info!(line = line + 1, "scanning line");
            with_link(&self.link, move |link| link.activate_auto_buffer(per_line, true).map(|_| ()))
                .await?;
            let filled = self.fill_line(line, result).await;
            let deactivated = with_link(&self.link, |link| link.deactivate_auto_buffer()).await;
            let complete = filled?;
            deactivated?;
            if !complete {
                return Ok(false);
            }
            result.lines_completed += 1;
            info!(line = line + 1, "line finished");
        }
        Ok(true)
    }

    /// Poll until the line is full. Returns `false` when aborted.
    ///
    /// Fails with [`DaqError::Timeout`] when the line is still short after
    /// [`ScanPlan::line_timeout`].
    async fn fill_line(&mut self, line: usize, result: &mut ScanResult) -> AppResult<bool> {
        let deadline = Instant::now() + self.plan.line_timeout;
        let mut collected = 0;
        while collected < self.plan.samples_per_line {
            if Instant::now() >= deadline {
                return Err(DaqError::Timeout(format!(
                    "line {} holds {collected} of {} samples after {:?}",
                    line + 1,
                    self.plan.samples_per_line,
                    self.plan.line_timeout
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.plan.poll) => {}
                _ = self.abort.cancelled() => return Ok(false),
            }
            let batch = with_link(&self.link, |link| link.new_auto_buffer_samples()).await?;
            if let Some(batch) = batch {
                self.place(&batch, line, collected, result)?;
                collected += batch.sample_count;
                if let Some(updates) = &self.updates {
                    let _ = updates.try_send(ScanUpdate {
                        line,
                        samples_in_line: collected,
                    });
                }
            }
            if self.abort.is_set() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn place(
        &mut self,
        batch: &SampleBatch,
        line: usize,
        offset: usize,
        result: &mut ScanResult,
    ) -> AppResult<()> {
        let decoded = self.decoder.decode(batch)?;
        let sat = self.plan.saturation_level;
        let full_scale = result.full_scale;
        for (id, image) in result.images.iter_mut() {
            let column = decoded.values_all(*id)?;
            for sample in 0..column.sample_count() {
                let row: Vec<f64> = if signal::is_distance(*id) {
                    column
                        .row(sample)
                        .iter()
                        .map(|v| distance_um(*v as i16, full_scale))
                        .collect()
                } else if signal::is_intensity(*id) {
                    column.row(sample).iter().map(|v| intensity_percent(*v, sat)).collect()
                } else {
                    column.row(sample).to_vec()
                };
                image.put(offset + sample, line, &row);
            }
        }
        if let Some(map) = result.saturation.as_mut() {
            let column = decoded.values_all(map.id)?;
            for sample in 0..column.sample_count() {
                let row: Vec<f64> =
                    column.row(sample).iter().map(|v| saturation_percent(*v, sat)).collect();
                map.put(offset + sample, line, &row);
            }
        }
        for (id, values) in result.globals.iter_mut() {
            values.extend(decoded.values_all(*id)?.values);
        }
        Ok(())
    }

    /// Closing sequence, run after every armed scan.
    ///
    /// Each restore step runs even when an earlier one failed: release the
    /// buffer, disarm the encoder trigger, restore the regular outputs and
    /// restart the data stream. Failures come back as
    /// [`DaqError::ShutdownFailed`].
    async fn close(&self) -> AppResult<()> {
        let encoder = matches!(self.plan.trigger, ScanTrigger::Encoder { .. });
        let errors = with_link(&self.link, move |link| {
            let mut errors = Vec::new();
            if let Err(e) = link.deactivate_auto_buffer() {
                errors.push(e);
            }
            if encoder {
                let disarm = Command::new(cmd::ENCODER_TRIGGER).arg(etr::ENABLE).arg(0);
                if let Err(e) = link.send(&disarm) {
                    errors.push(e);
                }
            }
            let ids: Vec<i32> = DEFAULT_OUTPUT_SIGNALS.iter().map(|id| i32::from(*id)).collect();
            let restore = Command::with_args(cmd::OUTPUT_SIGNALS, ids.into_iter().map(Arg::Int));
            if let Err(e) = link.send(&restore) {
                errors.push(e);
            }
            if let Err(e) = link.send(&Command::new(cmd::START_DATA_STREAM)) {
                errors.push(e);
            }
            Ok(errors)
        })
        .await?;
        if errors.is_empty() {
            return Ok(());
        }
        for err in &errors {
            warn!(error = %err, "scan closing step failed");
        }
        Err(DaqError::ShutdownFailed(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::link::DeviceLink;
    use crate::protocol::ids::OutputDataMode;
    use crate::sim::{simulated_intensity_raw, SimProfile, SimulatedSensor};

    fn open(profile: SimProfile) -> (SimulatedSensor, SharedLink) {
        let sensor = SimulatedSensor::new(profile);
        let link = DeviceLink::open(Arc::new(sensor.clone()), &ConnectionConfig::default()).unwrap();
        (sensor, Arc::new(parking_lot::Mutex::new(link)))
    }

    fn quick(lines: usize, samples: usize) -> ScanPlan {
        ScanPlan {
            poll: Duration::from_millis(5),
            ..ScanPlan::new(lines, samples)
        }
    }

    #[test]
    fn test_intensity_conversion_strips_sign() {
        assert_eq!(intensity_percent(4095.0, 4095.0), 100.0);
        assert_eq!(intensity_percent(1000.0, 3000.0), 33.333);
        // 0x8000 | 100: saturated sample keeps its magnitude.
        assert_eq!(intensity_percent(-32668.0, 4095.0), round3(100.0 / 4095.0 * 100.0));
        assert_eq!(saturation_percent(-5.0, 4095.0), SATURATED);
    }

    #[test]
    fn test_encoder_plan_subscribes_axis_first() {
        let plan = ScanPlan {
            peaks: 7,
            trigger: ScanTrigger::Encoder {
                axis: 1,
                start: 0.0,
                stop: 10.0,
                interval: 1.0,
            },
            ..ScanPlan::new(1, 1)
        };
        let ids = plan.output_signals();
        assert_eq!(ids[..2], [signal::ENCODER_Y, signal::SAMPLE_COUNTER]);
        assert_eq!(ids.len(), 2 + 8);
    }

    #[tokio::test]
    async fn test_free_run_scan_fills_every_line() {
        let (sensor, link) = open(SimProfile {
            channel_count: 2,
            ..SimProfile::default()
        });
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = ScanController::new(link, quick(3, 100)).with_updates(tx).run().await;

        assert_eq!(outcome.state, ScanState::Finished);
        let result = outcome.result;
        assert_eq!(result.lines_completed, 3);
        assert_eq!(result.channel_count, 2);
        let intensity = result.image(signal::INTENSITY_1).unwrap();
        assert_eq!((intensity.rows, intensity.columns), (100, 6));
        let expected = intensity_percent(f64::from(simulated_intensity_raw(0)), 4095.0);
        assert_eq!(intensity.value(99, 2, 0), Some(expected));
        assert!(intensity.line(2).unwrap().iter().all(|v| !v.is_nan()));
        assert_eq!(result.global(signal::SAMPLE_COUNTER).unwrap().len(), 300);
        assert_eq!(result.image(signal::DISTANCE_1).unwrap().unit, "um");
        assert!(matches!(rx.try_recv(), Ok(ScanUpdate { line: 0, .. })));

        // Closing sequence restored the regular subscription.
        assert_eq!(sensor.control().output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    }

    #[tokio::test]
    async fn test_distance_image_in_micrometres_for_both_modes() {
        for mode in [OutputDataMode::Raw, OutputDataMode::Double] {
            let (_sensor, link) = open(SimProfile::default());
            link.lock().set_output_data_mode(mode).unwrap();
            let outcome = ScanController::new(link, quick(1, 20)).run().await;
            assert_eq!(outcome.state, ScanState::Finished, "{mode:?}");
            let image = outcome.result.image(signal::DISTANCE_1).unwrap();
            // Simulated counts stay within 8384..=24784, i.e. 153..454 um at 600 um.
            assert!(
                image.data.iter().all(|v| (150.0..460.0).contains(v)),
                "{mode:?}: {:?}",
                &image.data[..4]
            );
            let counts = (image.data[0] * 32768.0 / 600.0).round() as i16;
            assert_eq!(image.data[0], distance_um(counts, 600.0));
        }
    }

    #[tokio::test]
    async fn test_abort_still_restores_outputs() {
        let (sensor, link) = open(SimProfile {
            auto_fill_per_poll: 1,
            ..SimProfile::default()
        });
        let controller = ScanController::new(link, quick(2, 10_000));
        let abort = controller.abort_signal();
        let mut state = controller.state();
        let task = tokio::spawn(controller.run());
        state.wait_for(|s| matches!(s, ScanState::Line(0))).await.unwrap();
        abort.trigger();
        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, ScanState::Aborted);
        assert_eq!(outcome.result.lines_completed, 0);
        assert_eq!(sensor.control().output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    }

    #[tokio::test]
    async fn test_encoder_scan_arms_trigger_and_disarms_after() {
        let (sensor, link) = open(SimProfile::default());
        let plan = ScanPlan {
            trigger: ScanTrigger::Encoder {
                axis: 0,
                start: 0.0,
                stop: 1000.0,
                interval: 10.0,
            },
            ..quick(1, 50)
        };
        let outcome = ScanController::new(link, plan).run().await;
        assert_eq!(outcome.state, ScanState::Finished);
        let encoder = outcome.result.global(signal::ENCODER_X).unwrap();
        assert_eq!(encoder[..3], [0.0, 10.0, 20.0]);
        assert_eq!(sensor.control().encoder_trigger()[etr::ENABLE as usize], 0.0);
    }

    #[tokio::test]
    async fn test_invalid_plan_fails_without_arming() {
        let (sensor, link) = open(SimProfile::default());
        let outcome = ScanController::new(link, quick(0, 10)).run().await;
        assert!(matches!(outcome.state, ScanState::Failed(_)));
        let seen = sensor.control().commands_seen();
        assert!(!seen.contains(&"STO".to_string()));
        assert!(!seen.contains(&"SODX".to_string()));
    }

    #[tokio::test]
    async fn test_failed_disarm_still_restores_outputs_and_stream() {
        let (sensor, link) = open(SimProfile {
            auto_fill_per_poll: 1,
            ..SimProfile::default()
        });
        let plan = ScanPlan {
            trigger: ScanTrigger::Encoder {
                axis: 0,
                start: 0.0,
                stop: 1000.0,
                interval: 10.0,
            },
            ..quick(1, 20)
        };
        let controller = ScanController::new(link, plan);
        let mut state = controller.state();
        let task = tokio::spawn(controller.run());
        state.wait_for(|s| matches!(s, ScanState::Line(0))).await.unwrap();
        sensor.control().reject(cmd::ENCODER_TRIGGER);

        let outcome = task.await.unwrap();
        let ScanState::Failed(reason) = &outcome.state else {
            panic!("expected failure, got {:?}", outcome.state);
        };
        assert!(reason.contains("Shutdown failed"), "{reason}");
        assert_eq!(outcome.result.lines_completed, 1);
        assert_eq!(sensor.control().output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
        assert!(sensor.control().is_streaming());
        assert_eq!(sensor.control().commands_seen().last().map(String::as_str), Some("STA"));
    }

    #[tokio::test]
    async fn test_arm_failure_restarts_stream() {
        let (sensor, link) = open(SimProfile::default());
        sensor.control().reject(cmd::NUMBER_OF_PEAKS);
        let outcome = ScanController::new(link, quick(1, 10)).run().await;
        let ScanState::Failed(reason) = &outcome.state else {
            panic!("expected failure, got {:?}", outcome.state);
        };
        assert!(reason.contains("Transport error"), "{reason}");
        let seen = sensor.control().commands_seen();
        assert!(seen.contains(&"STO".to_string()));
        assert_eq!(seen.last().map(String::as_str), Some("STA"));
        assert!(sensor.control().is_streaming());
        assert_eq!(sensor.control().output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    }

    #[tokio::test]
    async fn test_stalled_line_times_out() {
        let (sensor, link) = open(SimProfile {
            auto_fill_per_poll: 0,
            ..SimProfile::default()
        });
        let plan = ScanPlan {
            line_timeout: Duration::from_millis(50),
            ..quick(2, 10)
        };
        let outcome = ScanController::new(link, plan).run().await;
        let ScanState::Failed(reason) = &outcome.state else {
            panic!("expected failure, got {:?}", outcome.state);
        };
        assert!(reason.contains("Timed out"), "{reason}");
        assert!(reason.contains("line 1 holds 0 of 10"), "{reason}");
        assert_eq!(outcome.result.lines_completed, 0);
        assert_eq!(sensor.control().output_ids(), DEFAULT_OUTPUT_SIGNALS.to_vec());
    }

    #[tokio::test]
    async fn test_auto_buffer_error_fails_the_scan() {
        let (sensor, link) = open(SimProfile::default());
        sensor.control().fail_auto_buffer(true);
        let outcome = ScanController::new(link, quick(1, 10)).run().await;
        let ScanState::Failed(reason) = &outcome.state else {
            panic!("expected failure, got {:?}", outcome.state);
        };
        assert!(reason.contains("auto buffer error"), "{reason}");
        assert!(sensor.control().is_streaming());
    }
}
