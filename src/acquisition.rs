//! Blocking-link acquisition loop.
//!
//! The worker reads samples at the refresh rate, decodes them, publishes the
//! newest values and fans the batch out to the consumer queues. Reads run on
//! the blocking pool because the driver seam is synchronous.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AcquisitionSettings;
use crate::consumer::QueueTap;
use crate::decoder::{DecodedBatch, SampleBatch, SampleDecoder};
use crate::error::{AppResult, DaqError};
use crate::link::{with_link, DeviceLink, SharedLink};
use crate::pacing::{PacedPoll, StopSignal};
use crate::protocol::ids::signal;

/// Consecutive failed reads that end the loop.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Scale between a raw 16-bit distance and the measuring range.
pub const RAW_DISTANCE_SPAN: f64 = 32768.0;

/// Distance counts to micrometres.
pub fn distance_um(raw: i16, full_scale: f64) -> f64 {
    f64::from(raw) * full_scale / RAW_DISTANCE_SPAN
}

/// Newest decoded values, one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestValues {
    /// Sample counter of the newest sample.
    pub sample_counter: Option<u16>,
    /// Channel-1 distance in range counts.
    pub distance_raw: Option<i16>,
    /// Distance in micrometres.
    pub distance: Option<f64>,
    /// Channel-1 intensity, raw.
    pub intensity: Option<i16>,
    /// Encoder x counter.
    pub encoder_x: Option<i64>,
    /// Encoder y counter.
    pub encoder_y: Option<i64>,
    /// Encoder z counter.
    pub encoder_z: Option<i64>,
    /// Exposure flags word.
    pub exposure_flags: Option<i16>,
    /// Samples in the batch these values came from.
    pub sample_count: usize,
    /// When the batch was read.
    pub updated_at: Option<DateTime<Utc>>,
    /// Publication counter, starting at 1.
    pub sequence: u64,
}

/// Raised by readers once the latest values were shown.
#[derive(Debug)]
pub struct ConsumedSignal {
    consumed: AtomicBool,
    notify: Notify,
}

impl Default for ConsumedSignal {
    fn default() -> Self {
        Self {
            consumed: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }
}

impl ConsumedSignal {
    /// Mark the values shown and wake the loop.
    pub fn mark(&self) {
        self.consumed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Mark fresh values as not yet shown.
    pub fn clear(&self) {
        self.consumed.store(false, Ordering::Release);
    }

    /// Whether the last values were shown.
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Wait up to `limit` for a reader. Returns whether the values were taken.
    pub async fn wait(&self, limit: Duration) -> bool {
        if self.is_consumed() {
            return true;
        }
        let notified = self.notify.notified();
        if self.is_consumed() {
            return true;
        }
        let _ = tokio::time::timeout(limit, notified).await;
        self.is_consumed()
    }
}

/// Write side of the latest values, held by the running loop.
#[derive(Debug, Clone)]
pub struct LatestPublisher {
    tx: Arc<watch::Sender<LatestValues>>,
    consumed: Arc<ConsumedSignal>,
}

impl LatestPublisher {
    fn publish(&self, values: LatestValues) {
        self.tx.send_replace(values);
    }
}

/// Snapshot channel that outlives individual acquisition runs.
pub fn latest_channel() -> (LatestPublisher, LatestReader) {
    let (tx, rx) = watch::channel(LatestValues::default());
    let consumed = Arc::new(ConsumedSignal::default());
    let publisher = LatestPublisher {
        tx: Arc::new(tx),
        consumed: Arc::clone(&consumed),
    };
    (publisher, LatestReader { rx, consumed })
}

/// Read side of the latest values.
#[derive(Debug, Clone)]
pub struct LatestReader {
    rx: watch::Receiver<LatestValues>,
    consumed: Arc<ConsumedSignal>,
}

impl LatestReader {
    /// Current values without marking them consumed.
    pub fn peek(&self) -> LatestValues {
        self.rx.borrow().clone()
    }

    /// Current values, releasing the next read.
    pub fn take(&self) -> LatestValues {
        let values = self.rx.borrow().clone();
        self.consumed.mark();
        values
    }

    /// Wait for a publication newer than the last seen one.
    pub async fn changed(&mut self) -> AppResult<LatestValues> {
        self.rx
            .changed()
            .await
            .map_err(|_| DaqError::State("acquisition stopped".into()))?;
        Ok(self.take())
    }
}

/// Values shared between the session and a running loop.
#[derive(Debug)]
pub struct AcquisitionTuning {
    pull_count: AtomicUsize,
    full_scale_bits: AtomicU64,
    last_sample_fallback: AtomicBool,
}

impl AcquisitionTuning {
    /// Tuning starting at `pull_count` samples per read.
    pub fn new(pull_count: usize, full_scale: f64) -> Self {
        Self {
            pull_count: AtomicUsize::new(pull_count.max(1)),
            full_scale_bits: AtomicU64::new(full_scale.to_bits()),
            last_sample_fallback: AtomicBool::new(false),
        }
    }

    /// Samples requested per read.
    pub fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::Relaxed)
    }

    /// Set the read size; at least one sample.
    pub fn set_pull_count(&self, count: usize) {
        self.pull_count.store(count.max(1), Ordering::Relaxed);
    }

    /// Half the scan rate: one read per half second of data.
    pub fn follow_scan_rate(&self, hz: f64) {
        if hz.is_finite() && hz > 0.0 {
            self.set_pull_count((hz / 2.0) as usize);
        }
    }

    /// Measuring range used to scale distances.
    pub fn full_scale(&self) -> f64 {
        f64::from_bits(self.full_scale_bits.load(Ordering::Relaxed))
    }

    /// Follow a change of optical pen.
    pub fn set_full_scale(&self, full_scale: f64) {
        self.full_scale_bits.store(full_scale.to_bits(), Ordering::Relaxed);
    }

    /// Fall back to the most recent sample when a read returns nothing.
    pub fn set_last_sample_fallback(&self, on: bool) {
        self.last_sample_fallback.store(on, Ordering::Relaxed);
    }

    /// Whether empty reads fall back to the latest sample.
    pub fn last_sample_fallback(&self) -> bool {
        self.last_sample_fallback.load(Ordering::Relaxed)
    }
}

/// Per-batch columns fed to the trigger-loss verifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerRecord {
    /// Sample counters; always present.
    pub counters: Vec<u16>,
    /// Encoder x column.
    pub encoder_x: Option<Vec<i64>>,
    /// Encoder y column.
    pub encoder_y: Option<Vec<i64>>,
    /// Encoder z column.
    pub encoder_z: Option<Vec<i64>>,
    /// Exposure flags column.
    pub exposure_flags: Option<Vec<i16>>,
    /// Channel-1 distance as a raw 16-bit value.
    pub distance_raw: Option<Vec<i16>>,
}

impl TriggerRecord {
    /// Encoder column by axis index (0 = x).
    pub fn encoder(&self, axis: usize) -> Option<&[i64]> {
        match axis {
            0 => self.encoder_x.as_deref(),
            1 => self.encoder_y.as_deref(),
            2 => self.encoder_z.as_deref(),
            _ => None,
        }
    }

    /// Samples in the record.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the record holds no sample.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Consumer queues the loop feeds.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionTaps {
    /// Sample counters, widened for plotting.
    pub samples: Option<QueueTap<Vec<f64>>>,
    /// Channel-1 distances in micrometres.
    pub distance: Option<QueueTap<Vec<f64>>>,
    /// Columns for trigger-loss verification.
    pub trigger: Option<QueueTap<TriggerRecord>>,
}

/// How the loop ended.
#[derive(Debug)]
pub enum AcquisitionExit {
    /// The stop signal was raised.
    Stopped,
    /// Reads kept failing; the connection should be considered lost.
    Faulted(DaqError),
}

/// One decoded batch split into the columns the rest of the crate uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchColumns {
    /// Sample counters.
    pub counters: Option<Vec<u16>>,
    /// Channel-1 distance in range counts.
    pub distance_raw: Option<Vec<i16>>,
    /// Channel-1 distance in micrometres.
    pub distance: Option<Vec<f64>>,
    /// Channel-1 intensity, raw.
    pub intensity: Option<Vec<i16>>,
    /// Encoder x column.
    pub encoder_x: Option<Vec<i64>>,
    /// Encoder y column.
    pub encoder_y: Option<Vec<i64>>,
    /// Encoder z column.
    pub encoder_z: Option<Vec<i64>>,
    /// Exposure flags column.
    pub exposure_flags: Option<Vec<i16>>,
    /// Samples in the batch.
    pub sample_count: usize,
}

impl BatchColumns {
    /// Extract the known signals. The device reports distance as signed 16-bit
    /// counts of the measuring range in both output modes; they are converted
    /// to micrometres with `full_scale`.
    pub fn extract(batch: &DecodedBatch, full_scale: f64) -> Self {
        let column = |id: u16| batch.first_channel(id);
        let (distance_raw, distance) = match column(signal::DISTANCE_1) {
            None => (None, None),
            Some(values) => {
                let raw: Vec<i16> = values.iter().map(|v| *v as i16).collect();
                let scaled = raw.iter().map(|r| distance_um(*r, full_scale)).collect();
                (Some(raw), Some(scaled))
            }
        };
        let as_i64 = |id: u16| column(id).map(|v| v.into_iter().map(|x| x as i64).collect());
        let as_i16 = |id: u16| column(id).map(|v| v.into_iter().map(|x| x as i16).collect());
        Self {
            counters: column(signal::SAMPLE_COUNTER)
                .map(|v| v.into_iter().map(|x| x as u16).collect()),
            distance_raw,
            distance,
            intensity: as_i16(signal::INTENSITY_1),
            encoder_x: as_i64(signal::ENCODER_X),
            encoder_y: as_i64(signal::ENCODER_Y),
            encoder_z: as_i64(signal::ENCODER_Z),
            exposure_flags: as_i16(signal::EXPOSURE_FLAGS),
            sample_count: batch.sample_count(),
        }
    }

    fn any_encoder(&self) -> bool {
        self.encoder_x.is_some() || self.encoder_y.is_some() || self.encoder_z.is_some()
    }

    /// Values of the newest sample.
    pub fn latest(&self, sequence: u64) -> LatestValues {
        fn last<T: Copy>(v: &Option<Vec<T>>) -> Option<T> {
            v.as_ref().and_then(|v| v.last().copied())
        }
        LatestValues {
            sample_counter: last(&self.counters),
            distance_raw: last(&self.distance_raw),
            distance: last(&self.distance),
            intensity: last(&self.intensity),
            encoder_x: last(&self.encoder_x),
            encoder_y: last(&self.encoder_y),
            encoder_z: last(&self.encoder_z),
            exposure_flags: last(&self.exposure_flags),
            sample_count: self.sample_count,
            updated_at: Some(Utc::now()),
            sequence,
        }
    }

    /// Record for the trigger verifier, when counters and an encoder exist.
    pub fn trigger_record(&self) -> Option<TriggerRecord> {
        let counters = self.counters.clone()?;
        if !self.any_encoder() {
            return None;
        }
        Some(TriggerRecord {
            counters,
            encoder_x: self.encoder_x.clone(),
            encoder_y: self.encoder_y.clone(),
            encoder_z: self.encoder_z.clone(),
            exposure_flags: self.exposure_flags.clone(),
            distance_raw: self.distance_raw.clone(),
        })
    }
}

/// The acquisition loop before it is spawned.
pub struct AcquisitionWorker {
    link: SharedLink,
    decoder: SampleDecoder,
    tuning: Arc<AcquisitionTuning>,
    taps: AcquisitionTaps,
    latest: LatestPublisher,
    pacer: PacedPoll,
    gate_on_consumer: bool,
    stop: StopSignal,
    sequence: u64,
    flush_next: bool,
    failures: u32,
}

impl AcquisitionWorker {
    /// Loop reading `link` at the configured refresh rate.
    pub fn new(
        link: SharedLink,
        settings: &AcquisitionSettings,
        tuning: Arc<AcquisitionTuning>,
        taps: AcquisitionTaps,
        latest: LatestPublisher,
    ) -> Self {
        latest.consumed.mark();
        Self {
            link,
            decoder: SampleDecoder::new(),
            tuning,
            taps,
            latest,
            pacer: PacedPoll::new(settings.refresh_period()),
            gate_on_consumer: settings.gate_on_consumer,
            stop: StopSignal::new(),
            sequence: 0,
            flush_next: false,
            failures: 0,
        }
    }

    /// Spawn on the current runtime.
    pub fn spawn(self) -> AcquisitionHandle {
        self.spawn_with(|_| {})
    }

    /// Spawn, calling `on_exit` when the loop ends on its own or is stopped.
    pub fn spawn_with<F>(self, on_exit: F) -> AcquisitionHandle
    where
        F: FnOnce(&AcquisitionExit) + Send + 'static,
    {
        let stop = self.stop.clone();
        let task = tokio::spawn(async move {
            let exit = self.run().await;
            on_exit(&exit);
            exit
        });
        AcquisitionHandle { stop, task }
    }

    async fn run(mut self) -> AcquisitionExit {
        info!(period = ?self.pacer.period(), "acquisition started");
        if let Err(err) = self.blocking(|link| link.flush()).await {
            warn!(error = %err, "initial flush failed");
            self.flush_next = true;
        }
        let exit = loop {
            if !self.pacer.wait(&self.stop).await {
                break AcquisitionExit::Stopped;
            }
            if self.gate_on_consumer && !self.latest.consumed.wait(self.pacer.period()).await {
                self.pacer.finish();
                continue;
            }
            match self.read().await {
                Ok(Some(batch)) => {
                    self.failures = 0;
                    self.flush_next = false;
                    self.distribute(&batch);
                }
                Ok(None) => {
                    self.failures = 0;
                    self.flush_next = false;
                    self.pacer.finish();
                    tokio::select! {
                        _ = tokio::time::sleep(self.pacer.period()) => {}
                        _ = self.stop.cancelled() => break AcquisitionExit::Stopped,
                    }
                    continue;
                }
                Err(err) => {
                    self.failures += 1;
                    self.flush_next = true;
                    warn!(error = %err, failures = self.failures, "sample read failed");
                    if self.failures >= MAX_CONSECUTIVE_FAILURES {
                        break AcquisitionExit::Faulted(err);
                    }
                }
            }
            self.pacer.finish();
        };
        info!(?exit, "acquisition stopped");
        exit
    }

    async fn blocking<T, F>(&self, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DeviceLink) -> AppResult<T> + Send + 'static,
    {
        with_link(&self.link, op).await
    }

    async fn read(&self) -> AppResult<Option<SampleBatch>> {
        let count = self.tuning.pull_count();
        let flush = self.flush_next;
        let fallback = self.tuning.last_sample_fallback();
        self.blocking(move |link| match link.pull_samples(count, flush)? {
            Some(batch) => Ok(Some(batch)),
            None if fallback => link.last_sample(),
            None => Ok(None),
        })
        .await
    }

    fn distribute(&mut self, batch: &SampleBatch) {
        let decoded = match self.decoder.decode(batch) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping undecodable batch");
                return;
            }
        };
        let columns = BatchColumns::extract(&decoded, self.tuning.full_scale());
        self.sequence += 1;
        if self.gate_on_consumer {
            self.latest.consumed.clear();
        }
        self.latest.publish(columns.latest(self.sequence));

        if let (Some(tap), Some(counters)) = (&self.taps.samples, &columns.counters) {
            if tap.is_active() {
                tap.offer(counters.iter().map(|c| f64::from(*c)).collect());
            }
        }
        if let (Some(tap), Some(distance)) = (&self.taps.distance, &columns.distance) {
            tap.offer(distance.clone());
        }
        if let Some(tap) = &self.taps.trigger {
            if tap.is_active() {
                if let Some(record) = columns.trigger_record() {
                    tap.offer(record);
                }
            }
        }
        debug!(samples = columns.sample_count, sequence = self.sequence, "batch distributed");
    }
}

/// Owner side of a running loop.
#[derive(Debug)]
pub struct AcquisitionHandle {
    stop: StopSignal,
    task: JoinHandle<AcquisitionExit>,
}

impl AcquisitionHandle {
    /// Whether the loop task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Raise the stop signal without waiting.
    pub fn request_stop(&self) {
        self.stop.trigger();
    }

    /// Stop and wait for the loop to end.
    pub async fn stop_and_wait(self, limit: Duration) -> AppResult<AcquisitionExit> {
        self.stop.trigger();
        self.join(limit).await
    }

    /// Wait for the loop to end on its own.
    pub async fn join(mut self, limit: Duration) -> AppResult<AcquisitionExit> {
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(joined) => joined.map_err(|e| DaqError::State(format!("acquisition task: {e}"))),
            Err(_) => {
                self.task.abort();
                Err(DaqError::Timeout(format!(
                    "acquisition did not stop within {limit:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::consumer::distribution_queue;
    use crate::protocol::ids::OutputDataMode;
    use crate::sim::{simulated_distance_raw, SimProfile, SimulatedSensor};

    fn open(profile: SimProfile) -> (SimulatedSensor, SharedLink) {
        let sensor = SimulatedSensor::new(profile);
        let link = DeviceLink::open(Arc::new(sensor.clone()), &ConnectionConfig::default()).unwrap();
        (sensor, Arc::new(parking_lot::Mutex::new(link)))
    }

    fn fast_settings() -> AcquisitionSettings {
        AcquisitionSettings {
            refresh_hz: 100.0,
            gate_on_consumer: false,
            ..AcquisitionSettings::default()
        }
    }

    #[tokio::test]
    async fn test_latest_values_scaled_by_full_scale() {
        let (_sensor, link) = open(SimProfile {
            samples_per_pull: Some(10),
            ..SimProfile::default()
        });
        let tuning = Arc::new(AcquisitionTuning::new(100, 600.0));
        let (publisher, mut reader) = latest_channel();
        let worker =
            AcquisitionWorker::new(link, &fast_settings(), tuning, AcquisitionTaps::default(), publisher);
        let handle = worker.spawn();

        let values = reader.changed().await.unwrap();
        let raw = values.distance_raw.unwrap();
        assert_eq!(values.sample_count, 10);
        assert_eq!(values.sample_counter, Some(9));
        assert_eq!(raw, simulated_distance_raw(9, 0));
        assert_eq!(values.distance, Some(f64::from(raw) * 600.0 / 32768.0));
        assert!(values.encoder_x.is_none());

        let exit = handle.stop_and_wait(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(exit, AcquisitionExit::Stopped));
    }

    #[tokio::test]
    async fn test_double_mode_distance_is_scaled_like_raw_mode() {
        let (_sensor, link) = open(SimProfile {
            samples_per_pull: Some(4),
            ..SimProfile::default()
        });
        link.lock().set_output_data_mode(OutputDataMode::Double).unwrap();
        let tuning = Arc::new(AcquisitionTuning::new(100, 600.0));
        let (publisher, mut reader) = latest_channel();
        let worker =
            AcquisitionWorker::new(link, &fast_settings(), tuning, AcquisitionTaps::default(), publisher);
        let handle = worker.spawn();

        let values = reader.changed().await.unwrap();
        let raw = simulated_distance_raw(3, 0);
        assert_eq!(values.distance_raw, Some(raw));
        assert_eq!(values.distance, Some(distance_um(raw, 600.0)));
        handle.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn test_distance_counts_to_micrometres() {
        assert!((distance_um(16640, 600.0) - 304.6875).abs() < 1e-9);
        assert_eq!(distance_um(0, 600.0), 0.0);
        assert_eq!(distance_um(-16384, 600.0), -300.0);
    }

    #[tokio::test]
    async fn test_taps_receive_counters_and_distance_in_order() {
        let (_sensor, link) = open(SimProfile {
            samples_per_pull: Some(5),
            ..SimProfile::default()
        });
        let (samples_tap, mut samples_rx, samples_ctl) = distribution_queue("samples", 64);
        let (distance_tap, mut distance_rx, distance_ctl) = distribution_queue("distance", 64);
        samples_ctl.start();
        distance_ctl.start();
        let taps = AcquisitionTaps {
            samples: Some(samples_tap),
            distance: Some(distance_tap),
            trigger: None,
        };
        let tuning = Arc::new(AcquisitionTuning::new(100, 600.0));
        let (publisher, _reader) = latest_channel();
        let worker = AcquisitionWorker::new(link, &fast_settings(), tuning, taps, publisher);
        let handle = worker.spawn();

        let first = samples_rx.recv().await.unwrap();
        let second = samples_rx.recv().await.unwrap();
        assert_eq!(first, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(second, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
        assert_eq!(distance_rx.recv().await.unwrap().len(), 5);

        handle.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_read_failures_fault_the_loop() {
        let (sensor, link) = open(SimProfile {
            samples_per_pull: Some(5),
            ..SimProfile::default()
        });
        // Each pull flushes and retries once after the first failure.
        sensor.control().fail_next_reads(64);
        let tuning = Arc::new(AcquisitionTuning::new(10, 600.0));
        let (publisher, _reader) = latest_channel();
        let worker =
            AcquisitionWorker::new(link, &fast_settings(), tuning, AcquisitionTaps::default(), publisher);
        let faulted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&faulted);
        let handle = worker.spawn_with(move |exit| {
            flag.store(matches!(exit, AcquisitionExit::Faulted(_)), Ordering::SeqCst);
        });
        let exit = handle.join(Duration::from_secs(5)).await.unwrap();
        assert!(faulted.load(Ordering::SeqCst));
        match exit {
            AcquisitionExit::Faulted(err) => assert!(err.is_transport()),
            AcquisitionExit::Stopped => panic!("loop should have faulted"),
        }
    }

    #[tokio::test]
    async fn test_gate_holds_reads_until_consumed() {
        let (sensor, link) = open(SimProfile {
            samples_per_pull: Some(1),
            ..SimProfile::default()
        });
        let settings = AcquisitionSettings {
            refresh_hz: 200.0,
            gate_on_consumer: true,
            ..AcquisitionSettings::default()
        };
        let tuning = Arc::new(AcquisitionTuning::new(1, 600.0));
        let (publisher, mut reader) = latest_channel();
        let worker = AcquisitionWorker::new(link, &settings, tuning, AcquisitionTaps::default(), publisher);
        let handle = worker.spawn();

        let _ = reader.rx.changed().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One read published and nobody took it.
        assert_eq!(reader.peek().sequence, 1);
        let reads = sensor.control().reads();
        reader.take();
        let next = reader.changed().await.unwrap();
        assert_eq!(next.sequence, 2);
        assert!(sensor.control().reads() > reads);
        handle.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[test]
    fn test_scan_rate_sets_half_rate_pull_count() {
        let tuning = AcquisitionTuning::new(200, 600.0);
        tuning.follow_scan_rate(4000.0);
        assert_eq!(tuning.pull_count(), 2000);
        tuning.follow_scan_rate(0.0);
        assert_eq!(tuning.pull_count(), 2000);
        tuning.set_full_scale(1200.0);
        assert_eq!(tuning.full_scale(), 1200.0);
    }
}
