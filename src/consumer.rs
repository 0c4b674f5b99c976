//! Consumer queue workers and plot series aggregation.
//!
//! A [`ConsumerWorker`] drains one bounded distribution queue at its own
//! cadence and hands each non-empty drain to a [`BatchProcessor`]. Its
//! [`ConsumerControl`] has two independent switches:
//!
//! - on/off: off ends the worker,
//! - resumed/paused: paused holds the worker without draining, so queued
//!   items survive the pause.
//!
//! [`SeriesAggregator`] is the processor behind the live plots. It keeps a
//! `(time, value)` series on a time axis built from elapsed wall time, trims
//! the oldest fraction once the retention window is exceeded, and adjusts the
//! display's y limits with the hysteresis of an [`AxisPolicy`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::pacing::{PacedPoll, StopSignal};

const IDLE_POLL: Duration = Duration::from_millis(100);

// ===== Control =====

#[derive(Debug)]
struct ControlState {
    on: AtomicBool,
    resumed: AtomicBool,
    wake: Notify,
}

/// On/off and pause/resume switches shared by a worker and its producer.
#[derive(Debug, Clone)]
pub struct ConsumerControl {
    inner: Arc<ControlState>,
}

impl Default for ConsumerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerControl {
    /// Off and resumed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlState {
                on: AtomicBool::new(false),
                resumed: AtomicBool::new(true),
                wake: Notify::new(),
            }),
        }
    }

    /// Switch on. Producers begin feeding the queue.
    pub fn start(&self) {
        self.inner.on.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Switch off and wake any paused worker so it can end.
    pub fn stop(&self) {
        self.inner.on.store(false, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Hold the worker without draining the queue.
    pub fn pause(&self) {
        self.inner.resumed.store(false, Ordering::Release);
    }

    /// Release a paused worker.
    pub fn resume(&self) {
        self.inner.resumed.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Switched on.
    pub fn is_on(&self) -> bool {
        self.inner.on.load(Ordering::Acquire)
    }

    /// Not paused.
    pub fn is_resumed(&self) -> bool {
        self.inner.resumed.load(Ordering::Acquire)
    }

    /// A producer should feed the queue.
    pub fn is_active(&self) -> bool {
        self.is_on() && self.is_resumed()
    }

    /// Wait while paused. Returns `false` once the worker should end.
    pub async fn wait_resumed(&self, stop: &StopSignal) -> bool {
        loop {
            if !self.is_on() || stop.is_set() {
                return false;
            }
            if self.is_resumed() {
                return true;
            }
            let notified = self.inner.wake.notified();
            tokio::select! {
                _ = notified => {}
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }
}

/// Producer side of a distribution queue.
///
/// Offers are dropped while the consumer is inactive. A full queue drops the
/// item with a warning instead of blocking the producer.
#[derive(Debug, Clone)]
pub struct QueueTap<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    control: ConsumerControl,
}

impl<T> QueueTap<T> {
    /// Tap feeding `tx` while `control` is active.
    pub fn new(name: &'static str, tx: mpsc::Sender<T>, control: ConsumerControl) -> Self {
        Self { name, tx, control }
    }

    /// Queue name used in log fields.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether offers are currently accepted.
    pub fn is_active(&self) -> bool {
        self.control.is_active() && !self.tx.is_closed()
    }

    /// Returns whether the item was queued.
    pub fn offer(&self, item: T) -> bool {
        if !self.control.is_active() {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(queue = self.name, "queue full, dropping batch");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(queue = self.name, "queue closed, dropping batch");
                false
            }
        }
    }
}

/// Bounded queue plus the control shared by both ends.
pub fn distribution_queue<T>(
    name: &'static str,
    capacity: usize,
) -> (QueueTap<T>, mpsc::Receiver<T>, ConsumerControl) {
    let (tx, rx) = mpsc::channel(capacity);
    let control = ConsumerControl::new();
    (QueueTap::new(name, tx, control.clone()), rx, control)
}

// ===== Worker =====

/// Work done on each non-empty drain.
pub trait BatchProcessor: Send + 'static {
    /// What the queue carries.
    type Item: Send + 'static;

    /// `elapsed` is the wall time since the start of this cycle's pause,
    /// which spans the items being delivered.
    fn process(&mut self, items: Vec<Self::Item>, elapsed: Duration) -> ControlFlow<()>;
}

/// Why a worker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Control switched off or stop signalled.
    Stopped,
    /// The processor asked to stop.
    Finished,
    /// Every producer went away.
    Disconnected,
}

/// Paced drain loop over one queue.
pub struct ConsumerWorker<P: BatchProcessor> {
    name: &'static str,
    rx: mpsc::Receiver<P::Item>,
    processor: P,
    control: ConsumerControl,
    pacer: PacedPoll,
    stop: StopSignal,
    wait_for_data: bool,
}

impl<P: BatchProcessor> ConsumerWorker<P> {
    /// Worker on `rx` paced at `period`.
    pub fn new(
        name: &'static str,
        rx: mpsc::Receiver<P::Item>,
        processor: P,
        control: ConsumerControl,
        period: Duration,
    ) -> Self {
        Self {
            name,
            rx,
            processor,
            control,
            pacer: PacedPoll::new(period),
            stop: StopSignal::new(),
            wait_for_data: false,
        }
    }

    /// After each pause, keep waiting until at least one item is queued.
    pub fn wait_for_data(mut self, wait: bool) -> Self {
        self.wait_for_data = wait;
        self
    }

    /// Share an outer stop signal.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// The wrapped processor.
    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Queue receiver and processor, for reuse by a later worker.
    pub fn into_parts(self) -> (mpsc::Receiver<P::Item>, P) {
        (self.rx, self.processor)
    }

    /// Run until stopped. Returns the worker so it can be restarted.
    pub async fn run(mut self) -> (Self, WorkerExit) {
        info!(worker = self.name, "consumer started");
        let exit = self.drive().await;
        info!(worker = self.name, ?exit, "consumer stopped");
        (self, exit)
    }

    async fn drive(&mut self) -> WorkerExit {
        loop {
            if !self.control.wait_resumed(&self.stop).await {
                return WorkerExit::Stopped;
            }
            let cycle = Instant::now();
            if !self.pacer.wait(&self.stop).await {
                return WorkerExit::Stopped;
            }
            if self.wait_for_data {
                if let Some(exit) = self.wait_until_queued().await {
                    return exit;
                }
            }
            let mut items = Vec::new();
            loop {
                match self.rx.try_recv() {
                    Ok(item) => items.push(item),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if items.is_empty() {
                            return WorkerExit::Disconnected;
                        }
                        break;
                    }
                }
            }
            if items.is_empty() {
                self.pacer.finish();
                continue;
            }
            let flow = self.processor.process(items, cycle.elapsed());
            self.pacer.finish();
            if flow.is_break() {
                return WorkerExit::Finished;
            }
        }
    }

    async fn wait_until_queued(&mut self) -> Option<WorkerExit> {
        while self.rx.is_empty() {
            if !self.control.is_on() || self.stop.is_set() {
                return Some(WorkerExit::Stopped);
            }
            if self.rx.is_closed() {
                return Some(WorkerExit::Disconnected);
            }
            tokio::select! {
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = self.stop.cancelled() => return Some(WorkerExit::Stopped),
            }
        }
        None
    }
}

// ===== Series aggregation =====

/// One published plot series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    /// `(seconds, value)` pairs, oldest first.
    pub points: Vec<(f64, f64)>,
}

impl Series {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// No points yet.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Smallest and largest value, `None` when empty.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.points.iter().map(|p| p.1).fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

/// Display limits of a plot's value axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    /// Bottom of the axis.
    pub low: f64,
    /// Top of the axis.
    pub high: f64,
}

impl AxisLimits {
    /// Limits spanning `low..=high`.
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }
}

/// Where plot data goes. Rendering lives outside this crate.
pub trait DisplaySink: Send + 'static {
    /// Show `series`, replacing the previous one.
    fn publish(&mut self, series: &Series);
    /// Current value axis limits.
    fn y_limits(&self) -> AxisLimits;
    /// Move the value axis.
    fn set_y_limits(&mut self, limits: AxisLimits);
}

/// Hysteresis rule for the value axis.
pub trait AxisPolicy: Send + 'static {
    /// New limits for data spanning `min..=max`, given the current ones.
    fn adjust(&self, current: AxisLimits, min: f64, max: f64) -> AxisLimits;
}

/// Sample-counter plot: shift the floor when it is more than 5000 counts off,
/// raise the ceiling 20% past a new maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterAxis;

impl AxisPolicy for CounterAxis {
    fn adjust(&self, current: AxisLimits, min: f64, max: f64) -> AxisLimits {
        let mut next = current;
        if (min - current.low).abs() > 5000.0 {
            next.low = min - 5000.0;
        }
        if max > current.high {
            next.high = max * 1.2;
        }
        next
    }
}

/// Distance plot: limits follow the data amplitude, capped just above the
/// measuring range.
#[derive(Debug, Clone, Copy)]
pub struct DistanceAxis {
    /// Measuring range of the sensor.
    pub full_scale: f64,
}

impl AxisPolicy for DistanceAxis {
    fn adjust(&self, current: AxisLimits, min: f64, max: f64) -> AxisLimits {
        let amplitude = max - min;
        let mut next = current;
        if (min - current.low) > amplitude * 4.0 || current.low > min {
            next.low = min - amplitude * 1.5;
        } else if min == 0.0 {
            next.low = -20.0;
        }
        if max > current.high {
            next.high = (max + amplitude).min(self.full_scale + 10.0);
        } else if (current.high - max) > amplitude * 2.0 {
            next.high = max + amplitude;
        }
        next
    }
}

/// Running `(time, value)` series feeding a [`DisplaySink`].
pub struct SeriesAggregator<A: AxisPolicy, S: DisplaySink> {
    series: Series,
    time_index: f64,
    retention: f64,
    trim_fraction: f64,
    axis: A,
    sink: S,
}

impl<A: AxisPolicy, S: DisplaySink> SeriesAggregator<A, S> {
    /// Empty series publishing to `sink`.
    pub fn new(axis: A, sink: S, retention: Duration, trim_fraction: f64) -> Self {
        Self {
            series: Series::default(),
            time_index: 0.0,
            retention: retention.as_secs_f64(),
            trim_fraction,
            axis,
            sink,
        }
    }

    /// Current series.
    pub fn series(&self) -> &Series {
        &self.series
    }

    /// The sink being fed.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Axis policy, for range changes.
    pub fn axis_mut(&mut self) -> &mut A {
        &mut self.axis
    }

    /// Time of the newest point.
    pub fn time_index(&self) -> f64 {
        self.time_index
    }

    /// Append `values` spread evenly over `elapsed` and publish.
    ///
    /// An empty series starts at the current time index; later batches start
    /// one step past the newest point, so no timestamp repeats.
    pub fn append(&mut self, values: &[f64], elapsed: Duration) {
        if values.is_empty() {
            return;
        }
        let start = self.time_index;
        let span = elapsed.as_secs_f64();
        let n = values.len();
        let (first, step) = if self.series.points.is_empty() {
            (start, if n > 1 { span / (n - 1) as f64 } else { 0.0 })
        } else {
            let step = span / n as f64;
            (start + step, step)
        };
        self.series
            .points
            .extend(values.iter().enumerate().map(|(i, v)| (first + step * i as f64, *v)));
        self.time_index = start + span;
        self.sink.publish(&self.series);
        self.trim();
        self.adjust_limits();
    }

    fn trim(&mut self) {
        if self.time_index < self.retention {
            return;
        }
        let drop = (self.series.len() as f64 * self.trim_fraction) as usize;
        let Some(&(rebase, _)) = self.series.points.get(drop) else {
            return;
        };
        self.series.points.drain(..drop);
        for point in &mut self.series.points {
            point.0 -= rebase;
        }
        if let Some(&(last, _)) = self.series.points.last() {
            self.time_index = last;
        }
    }

    fn adjust_limits(&mut self) {
        let Some((min, max)) = self.series.min_max() else {
            return;
        };
        let current = self.sink.y_limits();
        let next = self.axis.adjust(current, min, max);
        if next != current {
            self.sink.set_y_limits(next);
        }
    }
}

impl<A: AxisPolicy, S: DisplaySink> BatchProcessor for SeriesAggregator<A, S> {
    type Item = Vec<f64>;

    fn process(&mut self, items: Vec<Vec<f64>>, elapsed: Duration) -> ControlFlow<()> {
        let values: Vec<f64> = items.into_iter().flatten().collect();
        self.append(&values, elapsed);
        ControlFlow::Continue(())
    }
}

/// Sink that keeps the last published series in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    inner: Arc<parking_lot::Mutex<MemorySinkState>>,
}

#[derive(Debug, Clone)]
struct MemorySinkState {
    series: Series,
    limits: AxisLimits,
    publishes: u64,
}

impl MemorySink {
    /// Sink with no series yet and the given limits.
    pub fn new(limits: AxisLimits) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(MemorySinkState {
                series: Series::default(),
                limits,
                publishes: 0,
            })),
        }
    }

    /// Copy of the last published series.
    pub fn snapshot(&self) -> Series {
        self.inner.lock().series.clone()
    }

    /// Current axis limits.
    pub fn limits(&self) -> AxisLimits {
        self.inner.lock().limits
    }

    /// Number of publishes so far.
    pub fn publishes(&self) -> u64 {
        self.inner.lock().publishes
    }
}

impl DisplaySink for MemorySink {
    fn publish(&mut self, series: &Series) {
        let mut state = self.inner.lock();
        state.series = series.clone();
        state.publishes += 1;
    }

    fn y_limits(&self) -> AxisLimits {
        self.inner.lock().limits
    }

    fn set_y_limits(&mut self, limits: AxisLimits) {
        self.inner.lock().limits = limits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(limits: AxisLimits) -> (SeriesAggregator<CounterAxis, MemorySink>, MemorySink) {
        let sink = MemorySink::new(limits);
        let agg = SeriesAggregator::new(CounterAxis, sink.clone(), Duration::from_secs(10), 0.2);
        (agg, sink)
    }

    #[test]
    fn test_time_axis_spreads_over_elapsed() {
        let (mut agg, sink) = aggregator(AxisLimits::new(0.0, 100.0));
        agg.append(&[1.0, 2.0, 3.0], Duration::from_secs(1));
        let points = sink.snapshot().points;
        assert_eq!(points, vec![(0.0, 1.0), (0.5, 2.0), (1.0, 3.0)]);
        agg.append(&[4.0], Duration::from_millis(500));
        assert_eq!(agg.time_index(), 1.5);
        assert_eq!(agg.series().points.last(), Some(&(1.5, 4.0)));
    }

    #[test]
    fn test_consecutive_batches_never_repeat_a_timestamp() {
        let (mut agg, _sink) = aggregator(AxisLimits::new(0.0, 100.0));
        agg.append(&[1.0, 2.0, 3.0], Duration::from_secs(1));
        agg.append(&[4.0, 5.0], Duration::from_secs(1));
        agg.append(&[6.0], Duration::from_millis(500));
        let times: Vec<f64> = agg.series().points.iter().map(|p| p.0).collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(agg.time_index(), 2.5);
    }

    #[test]
    fn test_trim_drops_oldest_fifth_and_rebases() {
        let (mut agg, _sink) = aggregator(AxisLimits::new(0.0, 100.0));
        let values: Vec<f64> = (0..11).map(f64::from).collect();
        agg.append(&values, Duration::from_secs(10));
        // 11 points; 2 dropped, origin moves to t = 2.
        assert_eq!(agg.series().len(), 9);
        assert_eq!(agg.series().points[0], (0.0, 2.0));
        assert_eq!(agg.time_index(), 8.0);
    }

    #[test]
    fn test_counter_axis_hysteresis() {
        let axis = CounterAxis;
        let lim = AxisLimits::new(0.0, 100.0);
        assert_eq!(axis.adjust(lim, 10.0, 90.0), lim);
        assert_eq!(axis.adjust(lim, 10.0, 200.0), AxisLimits::new(0.0, 240.0));
        assert_eq!(axis.adjust(lim, 9000.0, 9050.0), AxisLimits::new(4000.0, 9050.0 * 1.2));
    }

    #[test]
    fn test_distance_axis_follows_amplitude_and_caps() {
        let axis = DistanceAxis { full_scale: 600.0 };
        let lim = AxisLimits::new(0.0, 700.0);
        // Far above the floor: floor moves under the data, ceiling tightens.
        let next = axis.adjust(lim, 300.0, 310.0);
        assert_eq!(next, AxisLimits::new(285.0, 320.0));
        // New maximum above the ceiling, capped at range + 10.
        let next = axis.adjust(AxisLimits::new(280.0, 320.0), 290.0, 500.0);
        assert_eq!(next.high, 610.0);
        // Zero reading pins the floor at -20.
        let next = axis.adjust(AxisLimits::new(0.0, 100.0), 0.0, 60.0);
        assert_eq!(next.low, -20.0);
    }

    struct Collect(Arc<parking_lot::Mutex<Vec<u16>>>);

    impl BatchProcessor for Collect {
        type Item = Vec<u16>;

        fn process(&mut self, items: Vec<Vec<u16>>, _elapsed: Duration) -> ControlFlow<()> {
            std::thread::sleep(Duration::from_millis(15));
            self.0.lock().extend(items.into_iter().flatten());
            ControlFlow::Continue(())
        }
    }

    #[tokio::test]
    async fn test_worker_preserves_order_under_slow_processing() {
        let (tap, rx, control) = distribution_queue::<Vec<u16>>("samples", 256);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stop = StopSignal::new();
        control.start();
        let worker = ConsumerWorker::new(
            "samples",
            rx,
            Collect(Arc::clone(&seen)),
            control.clone(),
            Duration::from_millis(10),
        )
        .with_stop(stop.clone());
        let task = tokio::spawn(worker.run());

        for batch in 0..40u16 {
            assert!(tap.offer((batch * 5..batch * 5 + 5).collect()));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        while seen.lock().len() < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.trigger();
        let (_worker, exit) = task.await.unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
        let expected: Vec<u16> = (0..200).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_pause_keeps_queued_items() {
        let (tap, rx, control) = distribution_queue::<Vec<u16>>("samples", 8);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        control.start();
        control.pause();
        assert!(!tap.offer(vec![1]));
        let worker = ConsumerWorker::new(
            "samples",
            rx,
            Collect(Arc::clone(&seen)),
            control.clone(),
            Duration::from_millis(5),
        );
        let task = tokio::spawn(worker.run());

        // Queue while resumed, then pause before the worker drains.
        control.resume();
        assert!(tap.offer(vec![7, 8]));
        control.pause();
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.resume();
        while seen.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock(), vec![7, 8]);
        control.stop();
        let (_worker, exit) = task.await.unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_offer_while_inactive_is_dropped() {
        let (tap, mut rx, control) = distribution_queue::<u8>("distance", 1);
        assert!(!tap.offer(1));
        control.start();
        assert!(tap.offer(2));
        assert!(!tap.offer(3));
        assert!(logs_contain("queue full, dropping batch"));
        assert_eq!(rx.try_recv().ok(), Some(2));
    }
}
