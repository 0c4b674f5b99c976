//! Trigger-loss verification for encoder-triggered acquisition.
//!
//! While the device runs in trigger-each mode with the encoder trigger armed,
//! every sample should correspond to one trigger position. The monitor walks
//! the exposure flags of each sample:
//!
//! - bit 1: a trigger was lost; the missed position is one interval before
//!   the current encoder position,
//! - bit 2: triggers arrive faster than the exposure ("too fast"), cleared by
//!   the next sample without the bit.
//!
//! It stops once the tracked axis reaches the stop position. The final
//! [`TriggerLossReport`] compares the expected trigger count against the span
//! of sample counters actually observed.

use std::fmt::Write as _;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::acquisition::TriggerRecord;
use crate::consumer::BatchProcessor;
use crate::error::{AppResult, DaqError};

/// Exposure flag: trigger lost.
pub const FLAG_TRIGGER_LOST: i16 = 1 << 1;
/// Exposure flag: trigger arrived before the previous exposure finished.
pub const FLAG_TRIGGER_TOO_FAST: i16 = 1 << 2;

/// Positions closer than this to the stop position count as arrived.
pub const STOP_TOLERANCE: f64 = 2.0;

const AXIS_NAMES: [&str; 3] = ["X", "Y", "Z"];

/// Parameters of one verification run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerLossPlan {
    /// Encoder position of the first trigger.
    pub start: f64,
    /// Encoder position of the last trigger.
    pub stop: f64,
    /// Encoder distance between triggers.
    pub interval: f64,
    /// Tracked encoder axis, 0 = x, 1 = y, 2 = z.
    pub axis: usize,
    /// Fire the trigger also on the return stroke.
    pub on_return: bool,
}

impl TriggerLossPlan {
    /// Plan on the x axis, forward stroke only.
    pub fn new(start: f64, stop: f64, interval: f64) -> Self {
        Self {
            start,
            stop,
            interval,
            axis: 0,
            on_return: false,
        }
    }

    /// Track another encoder axis.
    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = axis;
        self
    }

    /// Interval positive, stop not before start, axis known.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.interval.is_finite() && self.interval > 0.0) {
            return Err(DaqError::Configuration(format!(
                "trigger interval must be positive, got {}",
                self.interval
            )));
        }
        if self.stop < self.start {
            return Err(DaqError::Configuration(format!(
                "trigger stop {} is before start {}",
                self.stop, self.start
            )));
        }
        if self.axis >= AXIS_NAMES.len() {
            return Err(DaqError::Configuration(format!(
                "trigger axis {} out of range",
                self.axis
            )));
        }
        Ok(())
    }

    /// Triggers between start and stop, both ends included.
    pub fn expected(&self) -> u64 {
        ((self.stop - self.start) / self.interval).floor().max(0.0) as u64 + 1
    }

    /// `X`, `Y` or `Z`.
    pub fn axis_name(&self) -> &'static str {
        AXIS_NAMES.get(self.axis).copied().unwrap_or("?")
    }

    fn reached_stop(&self, position: f64) -> bool {
        position >= self.stop || self.stop - position < STOP_TOLERANCE
    }
}

/// Live state published while the run progresses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriggerProgress {
    /// Samples counted so far.
    pub observed: u64,
    /// Gaps found so far.
    pub lost: usize,
    /// The sample rate could not keep up with the trigger.
    pub too_fast: bool,
    /// Latest encoder position.
    pub position: Option<i64>,
}

/// One sample kept for the report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TriggerRow {
    /// Sample counter value.
    pub counter: u16,
    /// Encoder position.
    pub position: i64,
    /// Exposure flags.
    pub flags: i16,
    /// First distance, raw.
    pub distance_raw: i16,
}

/// Running verifier, fed by the trigger distribution queue.
#[derive(Debug)]
pub struct TriggerLossMonitor {
    plan: TriggerLossPlan,
    first_counter: Option<u16>,
    last_counter: Option<u16>,
    rows: Vec<TriggerRow>,
    loss_positions: Vec<i64>,
    too_fast: bool,
    finished: bool,
    progress: watch::Sender<TriggerProgress>,
}

impl TriggerLossMonitor {
    /// Monitor for `plan` and a receiver of its progress.
    pub fn new(plan: TriggerLossPlan) -> (Self, watch::Receiver<TriggerProgress>) {
        let (progress, rx) = watch::channel(TriggerProgress::default());
        let monitor = Self {
            plan,
            first_counter: None,
            last_counter: None,
            rows: Vec::new(),
            loss_positions: Vec::new(),
            too_fast: false,
            finished: false,
            progress,
        };
        (monitor, rx)
    }

    /// Plan being verified.
    pub fn plan(&self) -> &TriggerLossPlan {
        &self.plan
    }

    /// The stop position was reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Encoder positions where a gap was found.
    pub fn loss_positions(&self) -> &[i64] {
        &self.loss_positions
    }

    /// Samples between the first and last counter seen, inclusive.
    pub fn observed(&self) -> u64 {
        match (self.first_counter, self.last_counter) {
            (Some(first), Some(last)) => u64::from(last.wrapping_sub(first)) + 1,
            _ => 0,
        }
    }

    /// Take one record. Returns whether the stop position was reached.
    pub fn ingest(&mut self, record: &TriggerRecord) -> bool {
        let Some(positions) = record.encoder(self.plan.axis) else {
            debug!(axis = self.plan.axis, "record lacks the tracked encoder, skipped");
            return self.finished;
        };
        if self.first_counter.is_none() {
            self.first_counter = record.counters.first().copied();
        }
        let interval = self.plan.interval as i64;
        for (j, &counter) in record.counters.iter().enumerate() {
            let position = positions.get(j).copied().unwrap_or_default();
            let flags = record
                .exposure_flags
                .as_ref()
                .and_then(|f| f.get(j).copied())
                .unwrap_or(0);
            if flags & FLAG_TRIGGER_LOST != 0 {
                self.loss_positions.push(position - interval);
            }
            self.too_fast = flags & FLAG_TRIGGER_TOO_FAST != 0;
            self.rows.push(TriggerRow {
                counter,
                position,
                flags,
                distance_raw: record
                    .distance_raw
                    .as_ref()
                    .and_then(|d| d.get(j).copied())
                    .unwrap_or(0),
            });
        }
        if let Some(&last) = record.counters.last() {
            self.last_counter = Some(last);
        }
        let last_position = positions.last().copied();
        if let Some(position) = last_position {
            if self.plan.reached_stop(position as f64) {
                self.finished = true;
            }
        }
        self.progress.send_replace(TriggerProgress {
            observed: self.observed(),
            lost: self.loss_positions.len(),
            too_fast: self.too_fast,
            position: last_position,
        });
        self.finished
    }

    /// Final report. `cancelled` marks a run stopped by the user.
    pub fn report(&self, scan_rate: f64, cancelled: bool) -> TriggerLossReport {
        let expected = self.plan.expected();
        let observed = self.observed();
        TriggerLossReport {
            plan: self.plan,
            scan_rate,
            expected,
            observed,
            lost: expected as i64 - observed as i64,
            loss_positions: self.loss_positions.clone(),
            rows: self.rows.clone(),
            cancelled,
            finished_at: Local::now(),
        }
    }
}

impl BatchProcessor for TriggerLossMonitor {
    type Item = TriggerRecord;

    fn process(&mut self, items: Vec<TriggerRecord>, _elapsed: Duration) -> ControlFlow<()> {
        for record in &items {
            if self.ingest(record) {
                info!(
                    observed = self.observed(),
                    lost = self.loss_positions.len(),
                    "trigger verification reached stop position"
                );
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Outcome of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerLossReport {
    /// Plan that ran.
    pub plan: TriggerLossPlan,
    /// Device sample rate during the run.
    pub scan_rate: f64,
    /// Triggers the plan implies.
    pub expected: u64,
    /// Samples counted.
    pub observed: u64,
    /// Expected minus observed; negative when extra samples arrived.
    pub lost: i64,
    /// Encoder positions of the gaps.
    pub loss_positions: Vec<i64>,
    /// Every sample seen, in order.
    pub rows: Vec<TriggerRow>,
    /// Stopped before the stop position.
    pub cancelled: bool,
    /// When the run ended.
    pub finished_at: DateTime<Local>,
}

impl TriggerLossReport {
    /// Lines shown to the operator when the run ends.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.cancelled {
            lines.push("[User Cancel]".to_string());
        }
        lines.push(format!("Trigger count should be = {}", self.expected));
        lines.push(format!("Trigger happened = {}", self.observed));
        lines.push(format!("Trigger Lost Count = {}", self.lost));
        lines.push(self.positions_line());
        lines
    }

    fn positions_line(&self) -> String {
        let list = self
            .loss_positions
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Trigger Lost Position (encoder {}) = [{list}]",
            self.plan.axis_name()
        )
    }

    /// Report text: header block, column header, one row per sample.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Scan Rate: {}Hz", self.scan_rate);
        let _ = writeln!(out, "Trigger count should be = {}", self.expected);
        let _ = writeln!(out, "Trigger happened = {}", self.observed);
        let _ = writeln!(out, "Trigger Lost Count = {}", self.lost);
        let _ = writeln!(out, "{}", self.positions_line());
        let _ = writeln!(out, "Trigger Lost Position Count: {}", self.loss_positions.len());
        let _ = writeln!(
            out,
            "Sample Counter(ID:83), Encoder {}, Exp. Flags (ID:76), Distance 1 Int16 CH1(ID:16640)",
            self.plan.axis_name()
        );
        for row in &self.rows {
            let _ = writeln!(
                out,
                "{},{},{},{}",
                row.counter, row.position, row.flags, row.distance_raw
            );
        }
        out
    }

    /// Write the rendered report to `writer`.
    pub fn write_to<W: Write>(&self, mut writer: W) -> AppResult<()> {
        writer.write_all(self.render().as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Write into `dir` under a timestamped name, creating the directory.
    pub fn save(&self, dir: &Path) -> AppResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let name = format!("{}.txt", self.finished_at.format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let file = std::fs::File::create(&path)?;
        self.write_to(std::io::BufWriter::new(file))?;
        info!(path = %path.display(), "trigger loss report saved");
        Ok(path)
    }
}
