//! Driver seam: the calls the native sensor library provides.
//!
//! [`DeviceLibrary`] opens connections and resolves result codes to text;
//! [`DriverHandle`] is one open connection. Both mirror the library at the
//! granularity of its C entry points, returning the raw (negative) result code
//! on failure. [`crate::link::DeviceLink`] turns those codes into
//! [`crate::error::DaqError`] values and enforces the operating mode.
//!
//! Non-blocking handles deliver responses and sample blocks through boxed
//! callbacks that may run on a library thread; implementations must not call
//! back into the handle from inside them.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::ConnectionConfig;
use crate::protocol::ids::{OperationMode, OutputDataMode, ReadStatus, SpectrumType};
use crate::protocol::{CommandId, RawResponse, Ticket, WireArg};
use crate::signal::SignalCatalog;

/// Library result: the raw negative code on failure.
pub type DriverResult<T> = Result<T, i32>;

/// Caller-owned region the device fills while the auto buffer is active.
pub type AutoBufferRegion = Arc<Mutex<Vec<u8>>>;

/// General response and update callback.
pub type ResponseCallback = Box<dyn Fn(RawResponse) + Send + Sync>;

/// Sample delivery callback.
pub type SampleCallback = Box<dyn Fn(RawSamples) + Send + Sync>;

/// One undecoded sample block.
#[derive(Debug, Clone)]
pub struct RawSamples {
    /// Outcome of the read.
    pub status: ReadStatus,
    /// Samples held in `data`.
    pub sample_count: usize,
    /// Data mode the samples were encoded in.
    pub mode: OutputDataMode,
    /// Format index of the catalog the block was encoded with.
    pub format_index: u32,
    /// Packed sample bytes.
    pub data: Bytes,
}

impl RawSamples {
    /// A block carrying no samples.
    pub fn empty(status: ReadStatus, mode: OutputDataMode, format_index: u32) -> Self {
        Self {
            status,
            sample_count: 0,
            mode,
            format_index,
            data: Bytes::new(),
        }
    }
}

/// Entry points that act on the library as a whole.
pub trait DeviceLibrary: Send + Sync {
    /// Open a connection described by `config`.
    fn open(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn DriverHandle>>;

    /// Human-readable text for a result code.
    fn error_string(&self, code: i32) -> String;

    /// Driver configuration file; only valid before the first connection opens.
    fn set_ini_file(&self, path: &Path) -> DriverResult<()>;

    /// Route the driver's own logs into `dir`.
    fn configure_logging(&self, dir: &Path, max_file_kib: u32, max_files: u32) -> DriverResult<()>;
}

/// One open connection.
pub trait DriverHandle: Send {
    /// Mode fixed at open time.
    fn mode(&self) -> OperationMode;

    /// Blocking command execution.
    fn exec(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> DriverResult<RawResponse>;

    /// Non-blocking command execution; the response arrives on the callback.
    fn exec_async(&mut self, id: CommandId, is_query: bool, args: &[WireArg]) -> DriverResult<Ticket>;

    /// Install the non-blocking response and sample callbacks.
    fn register_callbacks(
        &mut self,
        on_response: ResponseCallback,
        on_samples: SampleCallback,
    ) -> DriverResult<()>;

    /// Up to `max_count` new samples, oldest first.
    fn next_samples(&mut self, max_count: usize) -> DriverResult<RawSamples>;

    /// Only the newest sample.
    fn last_sample(&mut self) -> DriverResult<RawSamples>;

    /// Drop everything buffered.
    fn flush(&mut self) -> DriverResult<()>;

    /// Signals the device currently outputs.
    fn signal_catalog(&mut self) -> DriverResult<SignalCatalog>;

    /// Bytes of one output sample in the current data mode.
    fn sample_width(&mut self) -> DriverResult<usize>;

    /// Channels of the connected sensor.
    fn channel_count(&mut self) -> DriverResult<usize>;

    /// Select raw or scaled output.
    fn set_output_data_mode(&mut self, mode: OutputDataMode) -> DriverResult<()>;

    /// Current output data mode.
    fn output_data_mode(&mut self) -> DriverResult<OutputDataMode>;

    /// Bytes the library requires for `sample_count` auto-buffered samples.
    fn auto_buffer_size(&mut self, sample_count: usize) -> DriverResult<usize>;

    /// Start filling `region` with `sample_count` samples.
    fn activate_auto_buffer(&mut self, region: AutoBufferRegion, sample_count: usize) -> DriverResult<()>;

    /// Stop filling the auto buffer.
    fn deactivate_auto_buffer(&mut self) -> DriverResult<()>;

    /// Samples written to the auto buffer so far.
    fn saved_sample_count(&mut self) -> DriverResult<usize>;

    /// Raw auto buffer status code.
    fn auto_buffer_status(&mut self) -> DriverResult<i32>;

    /// Fetch one spectrum of `kind` for `channel`.
    fn download_spectrum(&mut self, kind: SpectrumType, channel: u32) -> DriverResult<RawResponse>;

    /// Error texts queued by the library.
    fn last_errors(&mut self) -> DriverResult<Vec<String>>;

    /// Empty the library's error queue.
    fn clear_errors(&mut self) -> DriverResult<()>;

    /// Second logical connection on the same physical link.
    fn open_shared(&mut self, mode: OperationMode) -> DriverResult<Box<dyn DriverHandle>>;

    /// Close this handle. Further calls fail.
    fn close(&mut self) -> DriverResult<()>;
}
