//! Simulated sensor implementing the driver seam.
//!
//! Provides a software device for tests and for running the CLI without
//! hardware. It keeps the command state a real sensor keeps (scan rate,
//! measuring range, peaks, output signals, encoder trigger parameters),
//! produces sample blocks in either data mode and fills auto buffers.
//!
//! # Behaviour
//!
//! - Blocking handles answer commands directly; non-blocking handles answer
//!   through the registered response callback with a fresh ticket.
//! - With [`SimProfile::samples_per_pull`] set, every read returns that many
//!   samples immediately; otherwise samples accrue in real time at the scan rate.
//! - [`SimControl`] injects faults: failing reads, format changes on a given
//!   read, muted commands, exposure-flag scripts and unsolicited messages.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::decoder::encode_record;
use crate::driver::{
    AutoBufferRegion, DeviceLibrary, DriverHandle, DriverResult, RawSamples, ResponseCallback,
    SampleCallback,
};
use crate::protocol::ids::{
    cmd, etr, signal, AutoBufferStatus, DeviceTriggerMode, OperationMode, OutputDataMode,
    ReadStatus, SpectrumType,
};
use crate::protocol::{CommandId, RawParam, RawResponse, ResponseFlags, Ticket, WireArg};
use crate::signal::{DataType, SignalCatalog, SignalDescriptor};

// ===== Result codes =====

/// Command id the device does not know.
pub const ERR_UNKNOWN_COMMAND: i32 = 0xC000_0003_u32 as i32;
/// Argument rejected.
pub const ERR_BAD_PARAMETER: i32 = 0xC000_0004_u32 as i32;
/// A scripted read failure.
pub const ERR_READ_FAILED: i32 = 0xC000_0010_u32 as i32;
/// Nothing answers at the address.
pub const ERR_UNREACHABLE: i32 = 0xC000_0020_u32 as i32;
/// Call on a closed handle.
pub const ERR_HANDLE_CLOSED: i32 = 0xC000_0021_u32 as i32;
/// Auto buffer region missing.
pub const ERR_POINTER_NOT_ASSIGNED: i32 = 0xC000_0030_u32 as i32;
/// Auto buffer call with none active.
pub const ERR_NO_AUTO_BUFFER: i32 = 0xC000_0031_u32 as i32;
/// Driver configuration after the first open.
pub const ERR_TOO_LATE: i32 = 0xC000_0040_u32 as i32;

/// Address that refuses connections.
pub const UNREACHABLE_ADDRESS: &str = "0.0.0.0";

/// Raw distance of peak `peak` at sample `index`.
pub fn simulated_distance_raw(index: u64, peak: usize) -> i16 {
    let phase = index as f64 * 0.01;
    (16384.0 + 8000.0 * phase.sin() + peak as f64 * 100.0) as i16
}

/// Raw intensity of peak `peak` without noise.
pub fn simulated_intensity_raw(peak: usize) -> i16 {
    1200 + 100 * peak as i16
}

/// Static properties of the simulated device.
#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Sensor channels.
    pub channel_count: usize,
    /// Sample rate in hertz.
    pub scan_rate: f64,
    /// Measuring range in micrometres.
    pub full_scale: f64,
    /// Fixed samples per read; `None` accrues samples in real time.
    pub samples_per_pull: Option<usize>,
    /// Samples added to an auto buffer each time its fill count is polled.
    pub auto_fill_per_poll: usize,
    /// Answer trigger and encoder commands with library-internal ids.
    pub legacy_replies: bool,
    /// Add seeded noise to the intensities.
    pub noise: bool,
    /// Noise seed.
    pub seed: u64,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            channel_count: 1,
            scan_rate: 2000.0,
            full_scale: 600.0,
            samples_per_pull: None,
            auto_fill_per_poll: 64,
            legacy_replies: false,
            noise: false,
            seed: 7,
        }
    }
}

type SharedResponseCallback = Arc<ResponseCallback>;
type SharedSampleCallback = Arc<SampleCallback>;

struct SimAutoBuffer {
    region: AutoBufferRegion,
    sample_count: usize,
    saved: usize,
}

struct ScheduledFormatChange {
    at_pull: u64,
    output_ids: Vec<u16>,
}

struct SimDevice {
    profile: SimProfile,
    scan_rate: f64,
    full_scale: f64,
    lamp_intensity: f64,
    threshold: i32,
    peaks: i32,
    data_average: i32,
    spectrum_average: i32,
    output_ids: Vec<u16>,
    format_index: u32,
    mode: OutputDataMode,
    streaming: bool,
    trigger_mode: DeviceTriggerMode,
    etr: [f64; 8],
    encoders: [i64; 5],
    counter: u16,
    emitted: u64,
    clock: Option<Instant>,
    clock_base: u64,
    encoder_triggers: u64,
    rng: StdRng,
    failing_pulls: u32,
    pulls: u64,
    format_changes: VecDeque<ScheduledFormatChange>,
    pending_format_status: bool,
    muted: HashSet<CommandId>,
    rejected: HashSet<CommandId>,
    flag_script: VecDeque<i16>,
    intensity_override: Option<i16>,
    fail_size_query: bool,
    auto_error: bool,
    auto: Option<SimAutoBuffer>,
    auto_activations: u32,
    errors: Vec<String>,
    next_ticket: u32,
    next_handle: u64,
    callbacks: Vec<(u64, SharedResponseCallback, SharedSampleCallback)>,
    opened: u64,
    live_handles: usize,
    ini_file: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    commands_seen: Vec<String>,
}

impl SimDevice {
    fn new(profile: SimProfile) -> Self {
        Self {
            scan_rate: profile.scan_rate,
            full_scale: profile.full_scale,
            lamp_intensity: 50.0,
            threshold: 30,
            peaks: 1,
            data_average: 1,
            spectrum_average: 1,
            output_ids: vec![signal::SAMPLE_COUNTER, signal::DISTANCE_1, signal::INTENSITY_1],
            format_index: 1,
            mode: OutputDataMode::Raw,
            streaming: true,
            trigger_mode: DeviceTriggerMode::FreeRun,
            etr: [0.0; 8],
            encoders: [0; 5],
            counter: 0,
            emitted: 0,
            clock: None,
            clock_base: 0,
            encoder_triggers: 0,
            rng: StdRng::seed_from_u64(profile.seed),
            failing_pulls: 0,
            pulls: 0,
            format_changes: VecDeque::new(),
            pending_format_status: false,
            muted: HashSet::new(),
            rejected: HashSet::new(),
            flag_script: VecDeque::new(),
            intensity_override: None,
            fail_size_query: false,
            auto_error: false,
            auto: None,
            auto_activations: 0,
            errors: Vec::new(),
            next_ticket: 1,
            next_handle: 1,
            callbacks: Vec::new(),
            opened: 0,
            live_handles: 0,
            ini_file: None,
            log_dir: None,
            commands_seen: Vec::new(),
            profile,
        }
    }

    fn data_type_of(id: u16) -> DataType {
        match id {
            signal::SAMPLE_COUNTER => DataType::U16,
            signal::ENCODER_X..=signal::ENCODER_V => DataType::I32,
            _ => DataType::I16,
        }
    }

    fn catalog(&self) -> SignalCatalog {
        let (global, peak): (Vec<u16>, Vec<u16>) = self
            .output_ids
            .iter()
            .partition(|id| **id < signal::PEAK_BASE);
        let global_count = global.len();
        let signals = global
            .into_iter()
            .chain(peak)
            .map(|id| SignalDescriptor::new(id, Self::data_type_of(id)))
            .collect();
        SignalCatalog::new(
            self.format_index,
            self.profile.channel_count,
            global_count,
            signals,
        )
        .unwrap_or_else(|_| SignalCatalog::empty())
    }

    fn set_output_ids(&mut self, ids: Vec<u16>) {
        let mut unique = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        if unique != self.output_ids {
            self.output_ids = unique;
            self.format_index = self.format_index.wrapping_add(1);
            debug!(format_index = self.format_index, "simulated output signals changed");
        }
    }

    fn encoder_trigger_enabled(&self) -> bool {
        self.etr[etr::ENABLE as usize] != 0.0 && self.etr[etr::INTERVAL as usize] > 0.0
    }

    fn encoder_axis(&self) -> usize {
        (self.etr[etr::AXIS as usize] as usize).min(4)
    }

    /// Samples left before the encoder passes the stop position.
    fn encoder_triggers_left(&self) -> u64 {
        let start = self.etr[etr::START as usize];
        let stop = self.etr[etr::STOP as usize];
        let interval = self.etr[etr::INTERVAL as usize];
        let total = ((stop - start) / interval).floor().max(-1.0) as i64 + 1;
        (total.max(0) as u64).saturating_sub(self.encoder_triggers)
    }

    /// Trigger-each mode samples only on armed encoder triggers.
    fn waiting_for_trigger(&self) -> bool {
        self.trigger_mode == DeviceTriggerMode::TriggerEach && !self.encoder_trigger_enabled()
    }

    fn due_samples(&mut self, max_count: usize) -> usize {
        if !self.streaming || self.waiting_for_trigger() {
            return 0;
        }
        let mut n = match self.profile.samples_per_pull {
            Some(n) => n,
            None => {
                let clock = *self.clock.get_or_insert_with(Instant::now);
                let target = self.clock_base + (clock.elapsed().as_secs_f64() * self.scan_rate) as u64;
                target.saturating_sub(self.emitted) as usize
            }
        };
        if self.encoder_trigger_enabled() {
            n = n.min(self.encoder_triggers_left() as usize);
        }
        n.min(max_count)
    }

    fn advance_encoders(&mut self) {
        if self.encoder_trigger_enabled() {
            let axis = self.encoder_axis();
            let start = self.etr[etr::START as usize];
            let interval = self.etr[etr::INTERVAL as usize];
            self.encoders[axis] = (start + self.encoder_triggers as f64 * interval) as i64;
            self.encoder_triggers += 1;
        } else {
            self.encoders[0] += 1;
        }
    }

    fn value_of(&mut self, id: u16, channel: usize) -> f64 {
        match id {
            signal::SAMPLE_COUNTER => f64::from(self.counter),
            signal::ENCODER_X..=signal::ENCODER_V => {
                self.encoders[(id - signal::ENCODER_X) as usize] as f64
            }
            signal::EXPOSURE_FLAGS => f64::from(self.flag_script.pop_front().unwrap_or(0)),
            id if signal::is_distance(id) => {
                let peak = (id - signal::PEAK_BASE) as usize / signal::PEAK_STRIDE as usize;
                // Range counts in either output mode; only the element width changes.
                f64::from(simulated_distance_raw(self.emitted, peak + channel))
            }
            id if signal::is_intensity(id) => {
                let peak = (id - signal::PEAK_BASE) as usize / signal::PEAK_STRIDE as usize;
                let base = self
                    .intensity_override
                    .unwrap_or_else(|| simulated_intensity_raw(peak));
                let jitter = if self.profile.noise {
                    self.rng.gen_range(-20..=20)
                } else {
                    0
                };
                f64::from(base.saturating_add(jitter))
            }
            _ => 0.0,
        }
    }

    fn produce(&mut self, n: usize) -> Vec<u8> {
        let catalog = self.catalog();
        let mut data = Vec::with_capacity(n * catalog.sample_width(self.mode));
        let mode = self.mode;
        for _ in 0..n {
            self.advance_encoders();
            let mut slots = Vec::with_capacity(catalog.slots_per_sample());
            for s in catalog.global_signals() {
                slots.push(self.value_of(s.id, 0));
            }
            for channel in 0..catalog.channel_count() {
                for s in catalog.peak_signals() {
                    slots.push(self.value_of(s.id, channel));
                }
            }
            let mut it = slots.into_iter();
            encode_record(&catalog, mode, &mut data, |_, _| it.next().unwrap_or(0.0));
            self.counter = self.counter.wrapping_add(1);
            self.emitted += 1;
        }
        data
    }

    fn read_block(&mut self, max_count: usize) -> DriverResult<RawSamples> {
        self.pulls += 1;
        if self.failing_pulls > 0 {
            self.failing_pulls -= 1;
            self.errors.push("read failed".into());
            return Err(ERR_READ_FAILED);
        }
        let mut status = ReadStatus::Success;
        if self.format_changes.front().is_some_and(|c| c.at_pull <= self.pulls) {
            if let Some(change) = self.format_changes.pop_front() {
                self.set_output_ids(change.output_ids);
                self.format_index = self.format_index.wrapping_add(1);
                status = ReadStatus::FormatChange;
            }
        } else if std::mem::take(&mut self.pending_format_status) {
            status = ReadStatus::FormatChange;
        }
        let n = self.due_samples(max_count);
        if n == 0 && status == ReadStatus::Success {
            status = ReadStatus::NotEnough;
        }
        let data = self.produce(n);
        Ok(RawSamples {
            status,
            sample_count: n,
            mode: self.mode,
            format_index: self.format_index,
            data: Bytes::from(data),
        })
    }

    fn sample_width(&self) -> usize {
        self.catalog().sample_width(self.mode)
    }

    fn fill_auto_buffer(&mut self) {
        let Some((count, saved)) = self.auto.as_ref().map(|a| (a.sample_count, a.saved)) else {
            return;
        };
        if self.waiting_for_trigger() {
            return;
        }
        let mut n = self.profile.auto_fill_per_poll.min(count - saved);
        if self.encoder_trigger_enabled() {
            n = n.min(self.encoder_triggers_left() as usize);
        }
        if n == 0 {
            return;
        }
        let width = self.sample_width();
        let data = self.produce(n);
        if let Some(auto) = self.auto.as_mut() {
            let mut region = auto.region.lock();
            let start = auto.saved * width;
            let end = (start + data.len()).min(region.len());
            region[start..end].copy_from_slice(&data[..end - start]);
            auto.saved += n;
        }
    }

    fn reply(&self, id: CommandId, params: Vec<RawParam>) -> RawResponse {
        RawResponse::ok(id, Ticket(0), params)
    }

    fn float_setting(args: &[WireArg], current: &mut f64) -> DriverResult<()> {
        if let Some(arg) = args.first() {
            *current = arg.as_f64().ok_or(ERR_BAD_PARAMETER)?;
        }
        Ok(())
    }

    fn int_setting(args: &[WireArg], current: &mut i32) -> DriverResult<()> {
        if let Some(arg) = args.first() {
            *current = arg.as_i32().ok_or(ERR_BAD_PARAMETER)?;
        }
        Ok(())
    }

    fn execute(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> RawResponse {
        self.commands_seen.push(id.mnemonic());
        let outcome = if self.rejected.contains(&id) {
            Err(ERR_BAD_PARAMETER)
        } else {
            self.execute_inner(id, is_query, args)
        };
        match outcome {
            Ok(mut rsp) => {
                if is_query {
                    rsp.flags = ResponseFlags(rsp.flags.0 | ResponseFlags::QUERY);
                }
                rsp
            }
            Err(code) => {
                self.errors.push(format!("{id}: command rejected ({code:#x})"));
                RawResponse::failed(id, Ticket(0), code)
            }
        }
    }

    fn execute_inner(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> DriverResult<RawResponse> {
        let query_only = is_query || args.is_empty();
        let rsp = match id {
            cmd::SCAN_RATE => {
                Self::float_setting(args, &mut self.scan_rate)?;
                if !args.is_empty() {
                    self.clock_base = self.emitted;
                    self.clock = None;
                }
                let rate = self.scan_rate as f32;
                self.reply(id, vec![RawParam::float(rate)])
            }
            cmd::FULL_SCALE => {
                Self::float_setting(args, &mut self.full_scale)?;
                let fs = self.full_scale as f32;
                self.reply(id, vec![RawParam::float(fs)])
            }
            cmd::LAMP_INTENSITY => {
                Self::float_setting(args, &mut self.lamp_intensity)?;
                let v = self.lamp_intensity as f32;
                self.reply(id, vec![RawParam::float(v)])
            }
            cmd::DETECTION_THRESHOLD => {
                Self::int_setting(args, &mut self.threshold)?;
                let v = self.threshold;
                self.reply(id, vec![RawParam::int(v)])
            }
            cmd::NUMBER_OF_PEAKS => {
                if let Some(arg) = args.first() {
                    let n = arg.as_i32().ok_or(ERR_BAD_PARAMETER)?;
                    if !(1..=signal::MAX_PEAKS as i32).contains(&n) {
                        return Err(ERR_BAD_PARAMETER);
                    }
                    self.peaks = n;
                }
                let v = self.peaks;
                self.reply(id, vec![RawParam::int(v)])
            }
            cmd::DATA_AVERAGE => {
                Self::int_setting(args, &mut self.data_average)?;
                let v = self.data_average;
                self.reply(id, vec![RawParam::int(v)])
            }
            cmd::SPECTRUM_AVERAGE => {
                Self::int_setting(args, &mut self.spectrum_average)?;
                let v = self.spectrum_average;
                self.reply(id, vec![RawParam::int(v)])
            }
            cmd::NUMBER_OF_CHANNELS => {
                let v = self.profile.channel_count as i32;
                self.reply(id, vec![RawParam::int(v)])
            }
            cmd::OPTICAL_PEN => self.reply(id, vec![RawParam::int(0)]),
            cmd::PEN_LIST => self.reply(
                id,
                vec![
                    RawParam::string("0: SNr 0001 SIM600\0"),
                    RawParam::string("1: SNr 0002 SIM3000\0"),
                ],
            ),
            cmd::FIRMWARE_VERSION => self.reply(id, vec![RawParam::string("SIM 1.0.0")]),
            cmd::DEVICE_TYPE => self.reply(id, vec![RawParam::string("CHRocodile SIM")]),
            cmd::CONF => self.reply(id, vec![RawParam::string("simulated")]),
            cmd::OUTPUT_SIGNALS => {
                if !query_only {
                    let mut ids = Vec::new();
                    for arg in args {
                        match arg {
                            WireArg::IntArray(v) => ids.extend(v.iter().map(|i| *i as u16)),
                            other => ids.push(other.as_i32().ok_or(ERR_BAD_PARAMETER)? as u16),
                        }
                    }
                    self.set_output_ids(ids);
                }
                let ids: Vec<i32> = self.output_ids.iter().map(|i| i32::from(*i)).collect();
                self.reply(id, vec![RawParam::int_array(&ids)])
            }
            cmd::START_DATA_STREAM => {
                self.streaming = true;
                self.reply(id, vec![])
            }
            cmd::STOP_DATA_STREAM => {
                self.streaming = false;
                self.reply(id, vec![])
            }
            cmd::DARK_REFERENCE | cmd::FAST_DARK_REFERENCE => {
                self.reply(id, vec![RawParam::float(self.scan_rate as f32)])
            }
            cmd::TRIGGER_CONTINUOUS | cmd::TRIGGER_WAIT | cmd::TRIGGER_EACH => {
                self.trigger_mode = match id {
                    cmd::TRIGGER_WAIT => DeviceTriggerMode::WaitTrigger,
                    cmd::TRIGGER_EACH => DeviceTriggerMode::TriggerEach,
                    _ => DeviceTriggerMode::FreeRun,
                };
                if self.profile.legacy_replies {
                    let code = self.trigger_mode.code();
                    self.reply(cmd::DEVICE_TRIGGER_MODE, vec![RawParam::int(code)])
                } else {
                    self.reply(id, vec![])
                }
            }
            cmd::ENCODER_TRIGGER => {
                let index = args.first().and_then(WireArg::as_i32).ok_or(ERR_BAD_PARAMETER)?;
                let slot = usize::try_from(index)
                    .ok()
                    .filter(|i| *i < self.etr.len())
                    .ok_or(ERR_BAD_PARAMETER)?;
                if let Some(v) = args.get(1).and_then(WireArg::as_f64) {
                    self.etr[slot] = v;
                    if index == etr::ENABLE || index == etr::START {
                        self.encoder_triggers = 0;
                    }
                }
                self.etr_reply(index)
            }
            cmd::ENCODER_POSITION => {
                let axis = args.first().and_then(WireArg::as_i32).ok_or(ERR_BAD_PARAMETER)?;
                let axis = usize::try_from(axis)
                    .ok()
                    .filter(|a| *a < self.encoders.len())
                    .ok_or(ERR_BAD_PARAMETER)?;
                if let Some(v) = args.get(1).and_then(WireArg::as_f64) {
                    self.encoders[axis] = v as i64;
                }
                let pos = self.encoders[axis] as i32;
                let reply_id = if self.profile.legacy_replies {
                    cmd::ENCODER_COUNTER
                } else {
                    id
                };
                self.reply(reply_id, vec![RawParam::int(axis as i32), RawParam::int(pos)])
            }
            _ => return Err(ERR_UNKNOWN_COMMAND),
        };
        Ok(rsp)
    }

    fn etr_reply(&self, index: i32) -> RawResponse {
        let value = self.etr[index as usize];
        if !self.profile.legacy_replies {
            return self.reply(
                cmd::ENCODER_TRIGGER,
                vec![RawParam::int(index), RawParam::float(value as f32)],
            );
        }
        if index == etr::ENABLE {
            return self.reply(cmd::ENCODER_TRIGGER_ENABLED, vec![RawParam::int(value as i32)]);
        }
        let e = |i: i32| self.etr[i as usize] as f32;
        let params = vec![
            RawParam::int(self.etr[etr::AXIS as usize] as i32),
            RawParam::float(e(etr::START)),
            RawParam::float(e(etr::STOP)),
            RawParam::float(e(etr::INTERVAL)),
            RawParam::int(self.etr[etr::ON_RETURN as usize] as i32),
        ];
        self.reply(cmd::ENCODER_TRIGGER_PROPERTY, params)
    }

    fn next_ticket(&mut self) -> Ticket {
        let t = Ticket(self.next_ticket);
        self.next_ticket = self.next_ticket.wrapping_add(1).max(1);
        t
    }
}

/// Simulated sensor; implements [`DeviceLibrary`].
#[derive(Clone)]
pub struct SimulatedSensor {
    shared: Arc<Mutex<SimDevice>>,
}

impl SimulatedSensor {
    /// Sensor with `profile`, not yet opened.
    pub fn new(profile: SimProfile) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SimDevice::new(profile))),
        }
    }

    /// Test hooks into the shared device state.
    pub fn control(&self) -> SimControl {
        SimControl {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(SimProfile::default())
    }
}

impl DeviceLibrary for SimulatedSensor {
    fn open(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn DriverHandle>> {
        if config.address == UNREACHABLE_ADDRESS {
            return Err(ERR_UNREACHABLE);
        }
        let mut dev = self.shared.lock();
        dev.opened += 1;
        dev.live_handles += 1;
        let id = dev.next_handle;
        dev.next_handle += 1;
        Ok(Box::new(SimHandle {
            id,
            mode: config.mode,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }

    fn error_string(&self, code: i32) -> String {
        match code {
            ERR_UNKNOWN_COMMAND => "unknown command".into(),
            ERR_BAD_PARAMETER => "invalid command parameter".into(),
            ERR_READ_FAILED => "sample read failed".into(),
            ERR_UNREACHABLE => "device not reachable".into(),
            ERR_HANDLE_CLOSED => "connection handle closed".into(),
            ERR_POINTER_NOT_ASSIGNED => "auto buffer pointer not assigned".into(),
            ERR_NO_AUTO_BUFFER => "auto buffer not active".into(),
            ERR_TOO_LATE => "must be set before the first connection".into(),
            other => format!("library error {other:#x}"),
        }
    }

    fn set_ini_file(&self, path: &Path) -> DriverResult<()> {
        let mut dev = self.shared.lock();
        if dev.opened > 0 {
            return Err(ERR_TOO_LATE);
        }
        dev.ini_file = Some(path.to_path_buf());
        Ok(())
    }

    fn configure_logging(&self, dir: &Path, _max_file_kib: u32, _max_files: u32) -> DriverResult<()> {
        self.shared.lock().log_dir = Some(dir.to_path_buf());
        Ok(())
    }
}

/// Test hooks into a [`SimulatedSensor`].
#[derive(Clone)]
pub struct SimControl {
    shared: Arc<Mutex<SimDevice>>,
}

impl SimControl {
    /// Fail the next `n` sample reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.shared.lock().failing_pulls = n;
    }

    /// Switch to `output_ids` and report a format change on read number `at_pull`.
    pub fn schedule_format_change(&self, at_pull: u64, output_ids: Vec<u16>) {
        self.shared.lock().format_changes.push_back(ScheduledFormatChange {
            at_pull,
            output_ids,
        });
    }

    /// Report a format-change status on the next read without changing signals.
    pub fn flag_format_change(&self) {
        self.shared.lock().pending_format_status = true;
    }

    /// Never answer `id` on non-blocking handles.
    pub fn mute(&self, id: CommandId) {
        self.shared.lock().muted.insert(id);
    }

    /// Answer every later `id` with a command error, on either handle mode.
    pub fn reject(&self, id: CommandId) {
        self.shared.lock().rejected.insert(id);
    }

    /// Exposure flags returned by the next samples, in order.
    pub fn script_exposure_flags(&self, flags: impl IntoIterator<Item = i16>) {
        self.shared.lock().flag_script.extend(flags);
    }

    /// Fixed raw intensity for every peak; `None` restores the default.
    pub fn set_intensity_raw(&self, raw: Option<i16>) {
        self.shared.lock().intensity_override = raw;
    }

    /// Make the auto-buffer size query fail.
    pub fn fail_size_query(&self, fail: bool) {
        self.shared.lock().fail_size_query = fail;
    }

    /// Report [`AutoBufferStatus::Error`] for an active auto buffer.
    pub fn fail_auto_buffer(&self, fail: bool) {
        self.shared.lock().auto_error = fail;
    }

    /// Fixed samples per read; `None` accrues in real time.
    pub fn set_samples_per_pull(&self, n: Option<usize>) {
        self.shared.lock().profile.samples_per_pull = n;
    }

    /// Handles opened and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.shared.lock().live_handles
    }

    /// Sample reads served.
    pub fn reads(&self) -> u64 {
        self.shared.lock().pulls
    }

    /// Current output format index.
    pub fn format_index(&self) -> u32 {
        self.shared.lock().format_index
    }

    /// Configured output signals.
    pub fn output_ids(&self) -> Vec<u16> {
        self.shared.lock().output_ids.clone()
    }

    /// Data output running.
    pub fn is_streaming(&self) -> bool {
        self.shared.lock().streaming
    }

    /// Encoder trigger registers as last set.
    pub fn encoder_trigger(&self) -> [f64; 8] {
        self.shared.lock().etr
    }

    /// Configuration file applied before opening.
    pub fn ini_file(&self) -> Option<PathBuf> {
        self.shared.lock().ini_file.clone()
    }

    /// Driver log directory, if configured.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.shared.lock().log_dir.clone()
    }

    /// Mnemonics of every command executed so far.
    pub fn commands_seen(&self) -> Vec<String> {
        self.shared.lock().commands_seen.clone()
    }

    /// Auto buffers handed to the device so far.
    pub fn auto_buffer_activations(&self) -> u32 {
        self.shared.lock().auto_activations
    }

    /// Deliver `n` samples to every non-blocking handle.
    pub fn push_samples(&self, n: usize) {
        self.push_block(n, ReadStatus::Success);
    }

    /// Deliver `n` samples flagged with `status` to every non-blocking handle.
    pub fn push_block(&self, n: usize, status: ReadStatus) {
        let (raw, callbacks) = {
            let mut dev = self.shared.lock();
            let data = dev.produce(n);
            let raw = RawSamples {
                status,
                sample_count: n,
                mode: dev.mode,
                format_index: dev.format_index,
                data: Bytes::from(data),
            };
            let callbacks: Vec<SharedSampleCallback> =
                dev.callbacks.iter().map(|(_, _, s)| Arc::clone(s)).collect();
            (raw, callbacks)
        };
        for cb in callbacks {
            cb(raw.clone());
        }
    }

    /// Deliver an unsolicited `MESG` to every non-blocking handle.
    pub fn push_message(&self, text: &str) {
        let callbacks: Vec<SharedResponseCallback> = self
            .shared
            .lock()
            .callbacks
            .iter()
            .map(|(_, r, _)| Arc::clone(r))
            .collect();
        let raw = RawResponse::ok(
            cmd::MESSAGE,
            Ticket(0),
            vec![
                RawParam::int(0),
                RawParam::int(0),
                RawParam::int(0),
                RawParam::string(text),
            ],
        );
        for cb in callbacks {
            cb(raw.clone());
        }
    }

    /// Deliver a response for `ticket` as if the device pushed an update.
    pub fn push_update(&self, ticket: Ticket, id: CommandId, params: Vec<RawParam>) {
        let callbacks: Vec<SharedResponseCallback> = self
            .shared
            .lock()
            .callbacks
            .iter()
            .map(|(_, r, _)| Arc::clone(r))
            .collect();
        let mut raw = RawResponse::ok(id, ticket, params);
        raw.flags = ResponseFlags(ResponseFlags::UPDATE);
        for cb in callbacks {
            cb(raw.clone());
        }
    }
}

struct SimHandle {
    id: u64,
    mode: OperationMode,
    shared: Arc<Mutex<SimDevice>>,
    closed: bool,
}

impl SimHandle {
    fn device(&self) -> DriverResult<parking_lot::MutexGuard<'_, SimDevice>> {
        if self.closed {
            return Err(ERR_HANDLE_CLOSED);
        }
        Ok(self.shared.lock())
    }
}

impl DriverHandle for SimHandle {
    fn mode(&self) -> OperationMode {
        self.mode
    }

    fn exec(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> DriverResult<RawResponse> {
        let mut dev = self.device()?;
        trace!(command = %id, is_query, "simulated exec");
        Ok(dev.execute(id, is_query, args))
    }

    fn exec_async(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> DriverResult<Ticket> {
        let (ticket, delivery) = {
            let mut dev = self.device()?;
            let ticket = dev.next_ticket();
            let mut rsp = dev.execute(id, is_query, args);
            rsp.ticket = ticket;
            let callback = dev
                .callbacks
                .iter()
                .find(|(h, _, _)| *h == self.id)
                .map(|(_, r, _)| Arc::clone(r));
            let delivery = if dev.muted.contains(&id) {
                None
            } else {
                callback.map(|cb| (cb, rsp))
            };
            (ticket, delivery)
        };
        if let Some((cb, rsp)) = delivery {
            cb(rsp);
        }
        Ok(ticket)
    }

    fn register_callbacks(
        &mut self,
        on_response: ResponseCallback,
        on_samples: SampleCallback,
    ) -> DriverResult<()> {
        let id = self.id;
        let mut dev = self.device()?;
        dev.callbacks.retain(|(h, _, _)| *h != id);
        dev.callbacks
            .push((id, Arc::new(on_response), Arc::new(on_samples)));
        Ok(())
    }

    fn next_samples(&mut self, max_count: usize) -> DriverResult<RawSamples> {
        self.device()?.read_block(max_count)
    }

    fn last_sample(&mut self) -> DriverResult<RawSamples> {
        let mut dev = self.device()?;
        let saved = (dev.counter, dev.emitted, dev.encoders, dev.encoder_triggers);
        let data = dev.produce(1);
        (dev.counter, dev.emitted, dev.encoders, dev.encoder_triggers) = saved;
        Ok(RawSamples {
            status: ReadStatus::Success,
            sample_count: 1,
            mode: dev.mode,
            format_index: dev.format_index,
            data: Bytes::from(data),
        })
    }

    fn flush(&mut self) -> DriverResult<()> {
        let mut dev = self.device()?;
        if dev.profile.samples_per_pull.is_none() {
            dev.clock_base = dev.emitted;
            dev.clock = None;
        }
        Ok(())
    }

    fn signal_catalog(&mut self) -> DriverResult<SignalCatalog> {
        Ok(self.device()?.catalog())
    }

    fn sample_width(&mut self) -> DriverResult<usize> {
        Ok(self.device()?.sample_width())
    }

    fn channel_count(&mut self) -> DriverResult<usize> {
        Ok(self.device()?.profile.channel_count)
    }

    fn set_output_data_mode(&mut self, mode: OutputDataMode) -> DriverResult<()> {
        self.device()?.mode = mode;
        Ok(())
    }

    fn output_data_mode(&mut self) -> DriverResult<OutputDataMode> {
        Ok(self.device()?.mode)
    }

    fn auto_buffer_size(&mut self, sample_count: usize) -> DriverResult<usize> {
        let dev = self.device()?;
        if dev.fail_size_query {
            return Err(ERR_POINTER_NOT_ASSIGNED);
        }
        Ok(dev.sample_width() * sample_count)
    }

    fn activate_auto_buffer(&mut self, region: AutoBufferRegion, sample_count: usize) -> DriverResult<()> {
        let mut dev = self.device()?;
        if region.lock().len() < dev.sample_width() * sample_count {
            return Err(ERR_BAD_PARAMETER);
        }
        dev.auto = Some(SimAutoBuffer {
            region,
            sample_count,
            saved: 0,
        });
        dev.auto_activations += 1;
        Ok(())
    }

    fn deactivate_auto_buffer(&mut self) -> DriverResult<()> {
        self.device()?.auto = None;
        Ok(())
    }

    fn saved_sample_count(&mut self) -> DriverResult<usize> {
        let mut dev = self.device()?;
        if dev.auto.is_none() {
            return Err(ERR_NO_AUTO_BUFFER);
        }
        dev.fill_auto_buffer();
        Ok(dev.auto.as_ref().map_or(0, |a| a.saved))
    }

    fn auto_buffer_status(&mut self) -> DriverResult<i32> {
        let dev = self.device()?;
        let status = match &dev.auto {
            Some(_) if dev.auto_error => AutoBufferStatus::Error,
            None => AutoBufferStatus::Deactivated,
            Some(a) if a.saved >= a.sample_count => AutoBufferStatus::Finished,
            Some(_) => AutoBufferStatus::Saving,
        };
        Ok(status.code())
    }

    fn download_spectrum(&mut self, kind: SpectrumType, channel: u32) -> DriverResult<RawResponse> {
        let dev = self.device()?;
        if channel as usize >= dev.profile.channel_count {
            return Err(ERR_BAD_PARAMETER);
        }
        let spectrum: Bytes = (0..512u16)
            .flat_map(|i| {
                let x = f64::from(i) - 256.0;
                ((4000.0 * (-x * x / 800.0).exp()) as u16).to_le_bytes()
            })
            .collect();
        Ok(RawResponse::ok(
            cmd::DOWNLOAD_SPECTRUM,
            Ticket(0),
            vec![
                RawParam::int(kind.code()),
                RawParam::int(channel as i32),
                RawParam::bytes(spectrum),
            ],
        ))
    }

    fn last_errors(&mut self) -> DriverResult<Vec<String>> {
        Ok(self.device()?.errors.clone())
    }

    fn clear_errors(&mut self) -> DriverResult<()> {
        self.device()?.errors.clear();
        Ok(())
    }

    fn open_shared(&mut self, mode: OperationMode) -> DriverResult<Box<dyn DriverHandle>> {
        let mut dev = self.device()?;
        let id = dev.next_handle;
        dev.next_handle += 1;
        dev.live_handles += 1;
        Ok(Box::new(SimHandle {
            id,
            mode,
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }

    fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        let id = self.id;
        let mut dev = self.shared.lock();
        dev.callbacks.retain(|(h, _, _)| *h != id);
        dev.live_handles = dev.live_handles.saturating_sub(1);
        drop(dev);
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{SampleBatch, SampleDecoder};

    fn open(sensor: &SimulatedSensor) -> Box<dyn DriverHandle> {
        sensor.open(&ConnectionConfig::default()).unwrap()
    }

    #[test]
    fn test_commands_keep_state() {
        let sensor = SimulatedSensor::default();
        let mut h = open(&sensor);
        h.exec(cmd::SCAN_RATE, false, &[WireArg::Int(4000)]).unwrap();
        let rsp = h.exec(cmd::SCAN_RATE, true, &[]).unwrap();
        assert_eq!(rsp.params, vec![RawParam::float(4000.0)]);
        assert!(rsp.flags.is_query());
        let bad = h.exec(CommandId::pack("XYZ"), false, &[]).unwrap();
        assert_eq!(bad.error_code, ERR_UNKNOWN_COMMAND);
    }

    #[test]
    fn test_output_signal_change_bumps_format_index() {
        let sensor = SimulatedSensor::default();
        let mut h = open(&sensor);
        let before = sensor.control().format_index();
        h.exec(cmd::OUTPUT_SIGNALS, false, &[WireArg::IntArray(vec![83, 16640, 16641])])
            .unwrap();
        assert_eq!(sensor.control().format_index(), before);
        h.exec(cmd::OUTPUT_SIGNALS, false, &[WireArg::IntArray(vec![65, 83, 16640])])
            .unwrap();
        assert_eq!(sensor.control().format_index(), before + 1);
        let catalog = h.signal_catalog().unwrap();
        assert_eq!(catalog.global_count(), 2);
        assert_eq!(catalog.peak_count(), 1);
    }

    #[test]
    fn test_blocks_decode_with_reported_catalog() {
        let sensor = SimulatedSensor::new(SimProfile {
            samples_per_pull: Some(5),
            ..SimProfile::default()
        });
        let mut h = open(&sensor);
        let raw = h.next_samples(100).unwrap();
        assert_eq!(raw.sample_count, 5);
        let batch = SampleBatch {
            status: raw.status,
            sample_count: raw.sample_count,
            mode: raw.mode,
            data: raw.data,
            catalog: Arc::new(h.signal_catalog().unwrap()),
        };
        let decoded = SampleDecoder::new().decode(&batch).unwrap();
        assert_eq!(decoded.value(83, 4).unwrap(), 4.0);
        assert_eq!(
            decoded.value(16640, 2).unwrap(),
            f64::from(simulated_distance_raw(2, 0))
        );
    }

    #[test]
    fn test_encoder_trigger_stops_at_stop_position() {
        let sensor = SimulatedSensor::new(SimProfile {
            samples_per_pull: Some(100),
            ..SimProfile::default()
        });
        let mut h = open(&sensor);
        for (index, value) in [(etr::START, 0), (etr::STOP, 100), (etr::INTERVAL, 10), (etr::ENABLE, 1)] {
            h.exec(cmd::ENCODER_TRIGGER, false, &[WireArg::Int(index), WireArg::Int(value)])
                .unwrap();
        }
        assert_eq!(h.next_samples(1000).unwrap().sample_count, 11);
        assert_eq!(h.next_samples(1000).unwrap().sample_count, 0);
    }

    #[test]
    fn test_auto_buffer_fills_in_steps() {
        let sensor = SimulatedSensor::new(SimProfile {
            auto_fill_per_poll: 40,
            ..SimProfile::default()
        });
        let mut h = open(&sensor);
        let width = h.sample_width().unwrap();
        let region: AutoBufferRegion = Arc::new(Mutex::new(vec![0; width * 100]));
        h.activate_auto_buffer(Arc::clone(&region), 100).unwrap();
        assert_eq!(h.saved_sample_count().unwrap(), 40);
        assert_eq!(h.saved_sample_count().unwrap(), 80);
        assert_eq!(h.saved_sample_count().unwrap(), 100);
        assert_eq!(h.auto_buffer_status().unwrap(), AutoBufferStatus::Finished.code());
        h.deactivate_auto_buffer().unwrap();
        assert_eq!(h.saved_sample_count(), Err(ERR_NO_AUTO_BUFFER));
    }

    #[test]
    fn test_ini_file_only_before_first_open() {
        let sensor = SimulatedSensor::default();
        assert!(sensor.set_ini_file(Path::new("a.ini")).is_ok());
        let _h = open(&sensor);
        assert_eq!(sensor.set_ini_file(Path::new("b.ini")), Err(ERR_TOO_LATE));
    }
}
