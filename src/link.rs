//! DeviceLink: one connection handle in blocking or non-blocking mode.
//!
//! ```text
//! Closed --open--> Open(Blocking) | Open(NonBlocking) --close--> Closed
//! ```
//!
//! A blocking link executes commands request/reply and pulls sample blocks.
//! A non-blocking link issues ticketed commands; responses and sample blocks
//! arrive on channels registered with the driver at open time and are taken
//! by whoever owns the link (normally [`crate::dispatcher::AsyncDispatcher`]).
//!
//! Closing a non-blocking link first waits, bounded by
//! `ConnectionConfig::close_timeout`, for every outstanding ticket to clear.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::decoder::SampleBatch;
use crate::driver::{AutoBufferRegion, DeviceLibrary, DriverHandle, RawSamples};
use crate::error::{AppResult, DaqError};
use crate::protocol::ids::{
    cmd, AutoBufferStatus, OperationMode, OutputDataMode, ReadStatus, SpectrumType,
};
use crate::protocol::{Command, RawResponse, Response, Ticket};
use crate::signal::{CatalogCell, SignalCatalog};

/// Link shared between the workers that take turns issuing blocking calls.
pub type SharedLink = Arc<Mutex<DeviceLink>>;

/// Run `op` against a shared link on the blocking pool.
pub async fn with_link<T, F>(link: &SharedLink, op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut DeviceLink) -> AppResult<T> + Send + 'static,
{
    let link = Arc::clone(link);
    tokio::task::spawn_blocking(move || op(&mut link.lock()))
        .await
        .map_err(|e| DaqError::State(format!("blocking link task failed: {e}")))?
}

/// Sample blocks buffered between the driver callback and their consumer.
const ASYNC_SAMPLE_BACKLOG: usize = 64;

/// Count of tickets still awaiting a response.
///
/// Written by the dispatcher that owns the ticket table, read by
/// [`DeviceLink::close`].
#[derive(Debug, Clone, Default)]
pub struct TicketGauge(Arc<AtomicUsize>);

impl TicketGauge {
    /// Tickets currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Publish the table size.
    pub fn set(&self, n: usize) {
        self.0.store(n, Ordering::Release);
    }
}

/// Receivers for everything a non-blocking link delivers.
#[derive(Debug)]
pub struct LinkInbound {
    /// Command responses and unsolicited updates.
    pub responses: mpsc::UnboundedReceiver<RawResponse>,
    /// Sample blocks from the data callback.
    pub samples: mpsc::Receiver<RawSamples>,
}

/// Auto-buffer byte size for `sample_count` samples of `width` bytes.
///
/// Raw records are packed, so the byte stride is rounded up to the next
/// multiple of 8.
pub fn auto_buffer_len(width: usize, sample_count: usize, mode: OutputDataMode) -> usize {
    let bytes = width * sample_count;
    match mode {
        OutputDataMode::Raw => (bytes + 7) & !7,
        OutputDataMode::Double => bytes,
    }
}

#[derive(Debug)]
struct AutoBuffer {
    region: AutoBufferRegion,
    sample_count: usize,
    width: usize,
    mode: OutputDataMode,
    catalog: Arc<SignalCatalog>,
    /// Samples already handed out by `new_auto_buffer_samples`.
    read_cursor: usize,
}

/// Flags raised from the sample callback for the owner to act on.
#[derive(Debug, Default)]
struct AsyncBufferFlags {
    reactivate: AtomicBool,
}

/// An open connection to one sensor, over either handle mode.
pub struct DeviceLink {
    library: Arc<dyn DeviceLibrary>,
    handle: Option<Box<dyn DriverHandle>>,
    config: ConnectionConfig,
    mode: OperationMode,
    catalog: Arc<CatalogCell>,
    tickets: TicketGauge,
    auto_buffer: Option<AutoBuffer>,
    async_flags: Arc<AsyncBufferFlags>,
    inbound: Option<LinkInbound>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("address", &self.config.address)
            .field("mode", &self.mode)
            .field("open", &self.handle.is_some())
            .field("format_index", &self.catalog.format_index())
            .finish()
    }
}

impl DeviceLink {
    /// Open a connection in `config.mode`.
    pub fn open(library: Arc<dyn DeviceLibrary>, config: &ConnectionConfig) -> AppResult<Self> {
        config.validate()?;
        let handle = library
            .open(config)
            .map_err(|code| DaqError::transport(code, library.error_string(code)))?;
        info!(address = %config.address, mode = ?config.mode, "connection opened");
        Self::from_handle(library, handle, config.clone())
    }

    fn from_handle(
        library: Arc<dyn DeviceLibrary>,
        handle: Box<dyn DriverHandle>,
        config: ConnectionConfig,
    ) -> AppResult<Self> {
        let mut link = Self {
            library,
            mode: handle.mode(),
            handle: Some(handle),
            config,
            catalog: Arc::new(CatalogCell::default()),
            tickets: TicketGauge::default(),
            auto_buffer: None,
            async_flags: Arc::new(AsyncBufferFlags::default()),
            inbound: None,
        };
        if link.mode == OperationMode::NonBlocking {
            link.register_callbacks()?;
        }
        Ok(link)
    }

    fn register_callbacks(&mut self) -> AppResult<()> {
        let (rsp_tx, rsp_rx) = mpsc::unbounded_channel();
        let (smp_tx, smp_rx) = mpsc::channel(ASYNC_SAMPLE_BACKLOG);
        let flags = Arc::clone(&self.async_flags);
        let watch_buffer = self.config.async_auto_buffer;

        let on_response = Box::new(move |raw: RawResponse| {
            if rsp_tx.send(raw).is_err() {
                debug!("response dropped, receiver gone");
            }
        });
        let on_samples = Box::new(move |raw: RawSamples| {
            if watch_buffer
                && matches!(raw.status, ReadStatus::FormatChange | ReadStatus::BufferFull)
            {
                flags.reactivate.store(true, Ordering::Release);
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = smp_tx.try_send(raw) {
                warn!("async sample backlog full, dropping block");
            }
        });
        let handle = self.handle_mut()?;
        let result = handle.register_callbacks(on_response, on_samples);
        self.check(result)?;
        self.inbound = Some(LinkInbound {
            responses: rsp_rx,
            samples: smp_rx,
        });
        Ok(())
    }

    /// Open a second logical link on the same physical connection.
    pub fn open_shared(&mut self, mode: OperationMode) -> AppResult<DeviceLink> {
        let result = self.handle_mut()?.open_shared(mode);
        let handle = self.check(result)?;
        info!(address = %self.config.address, ?mode, "shared connection opened");
        Self::from_handle(
            Arc::clone(&self.library),
            handle,
            self.config.with_mode(mode),
        )
    }

    /// Handle mode chosen at open time.
    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Not yet closed.
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Options the link was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<SignalCatalog> {
        self.catalog.load()
    }

    /// Gauge the dispatcher keeps current.
    pub fn ticket_gauge(&self) -> TicketGauge {
        self.tickets.clone()
    }

    /// Take the response and sample receivers of a non-blocking link.
    pub fn take_inbound(&mut self) -> Option<LinkInbound> {
        self.inbound.take()
    }

    /// Library text for `code`.
    pub fn error_string(&self, code: i32) -> String {
        self.library.error_string(code)
    }

    /// Library the link was opened through.
    pub fn library(&self) -> Arc<dyn DeviceLibrary> {
        Arc::clone(&self.library)
    }

    fn handle_mut(&mut self) -> AppResult<&mut Box<dyn DriverHandle>> {
        self.handle
            .as_mut()
            .ok_or_else(|| DaqError::State("connection is closed".into()))
    }

    fn check<T>(&self, result: Result<T, i32>) -> AppResult<T> {
        result.map_err(|code| DaqError::transport(code, self.library.error_string(code)))
    }

    fn require(&self, mode: OperationMode, operation: &str) -> AppResult<()> {
        if self.handle.is_none() {
            return Err(DaqError::State(format!("{operation}: connection is closed")));
        }
        if self.mode != mode {
            return Err(DaqError::State(format!(
                "{operation} needs a {mode:?} connection, this one is {:?}",
                self.mode
            )));
        }
        Ok(())
    }

    // ===== Commands =====

    /// Execute a command and wait for its response.
    pub fn send(&mut self, command: &Command) -> AppResult<Response> {
        self.require(OperationMode::Blocking, "send")?;
        let args = command.encode();
        let result = self
            .handle_mut()?
            .exec(command.id(), command.is_query(), &args);
        let raw = self.check(result)?;
        let library = Arc::clone(&self.library);
        let response = Response::decode(&raw).into_result(|c| library.error_string(c))?;
        if command.id() == cmd::OUTPUT_SIGNALS && !command.is_query() {
            self.refresh_catalog()?;
        }
        Ok(response)
    }

    /// Parse and execute console text.
    pub fn send_text(&mut self, text: &str) -> AppResult<Response> {
        let command = Command::parse(text)?;
        self.send(&command)
    }

    /// Issue a command without waiting; the response carries the ticket.
    pub fn send_async(&mut self, command: &Command) -> AppResult<Ticket> {
        self.require(OperationMode::NonBlocking, "send_async")?;
        let args = command.encode();
        let result = self
            .handle_mut()?
            .exec_async(command.id(), command.is_query(), &args);
        self.check(result)
    }

    // ===== Samples =====

    /// Query the catalog from the device and install it.
    pub fn refresh_catalog(&mut self) -> AppResult<Arc<SignalCatalog>> {
        let result = self.handle_mut()?.signal_catalog();
        let catalog = self.check(result)?;
        if catalog.format_index() != self.catalog.format_index() {
            debug!(
                from = self.catalog.format_index(),
                to = catalog.format_index(),
                "signal catalog changed"
            );
        }
        Ok(self.catalog.replace(catalog))
    }

    /// Attach the current catalog to a raw block, refreshing it first when the
    /// block reports another format.
    pub fn resolve(&mut self, raw: RawSamples) -> AppResult<SampleBatch> {
        let stale = raw.status == ReadStatus::FormatChange
            || raw.format_index != self.catalog.format_index();
        let catalog = if stale {
            self.refresh_catalog()?
        } else {
            self.catalog.load()
        };
        Ok(SampleBatch {
            status: raw.status,
            sample_count: raw.sample_count,
            mode: raw.mode,
            data: raw.data,
            catalog,
        })
    }

    /// One read of up to `max_count` samples.
    ///
    /// With `flush_on_error` a failed read flushes the device buffer and is
    /// retried once. Returns `None` when no samples were available.
    pub fn pull_samples(
        &mut self,
        max_count: usize,
        flush_on_error: bool,
    ) -> AppResult<Option<SampleBatch>> {
        self.require(OperationMode::Blocking, "pull_samples")?;
        let first = self.handle_mut()?.next_samples(max_count);
        let raw = match first {
            Ok(raw) => raw,
            Err(code) if flush_on_error => {
                warn!(code, "sample read failed, flushing and retrying once");
                let flushed = self.handle_mut()?.flush();
                self.check(flushed)?;
                let retry = self.handle_mut()?.next_samples(max_count);
                self.check(retry)?
            }
            Err(code) => return Err(DaqError::transport(code, self.library.error_string(code))),
        };
        let batch = self.resolve(raw)?;
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Most recent sample without consuming the stream.
    pub fn last_sample(&mut self) -> AppResult<Option<SampleBatch>> {
        self.require(OperationMode::Blocking, "last_sample")?;
        let result = self.handle_mut()?.last_sample();
        let raw = self.check(result)?;
        let batch = self.resolve(raw)?;
        Ok((!batch.is_empty()).then_some(batch))
    }

    /// Discard buffered samples.
    pub fn flush(&mut self) -> AppResult<()> {
        let result = self.handle_mut()?.flush();
        self.check(result)
    }

    /// Catalog of the signals currently output, refreshed from the device.
    pub fn output_signal_infos(&mut self) -> AppResult<Arc<SignalCatalog>> {
        self.refresh_catalog()
    }

    /// Bytes of one record in the current data mode.
    pub fn sample_width(&mut self) -> AppResult<usize> {
        let result = self.handle_mut()?.sample_width();
        self.check(result)
    }

    /// Channels of the sensor.
    pub fn channel_count(&mut self) -> AppResult<usize> {
        let result = self.handle_mut()?.channel_count();
        self.check(result)
    }

    /// Switch between raw and scaled sample output.
    pub fn set_output_data_mode(&mut self, mode: OutputDataMode) -> AppResult<()> {
        let result = self.handle_mut()?.set_output_data_mode(mode);
        self.check(result)
    }

    /// Data mode the device reports.
    pub fn output_data_mode(&mut self) -> AppResult<OutputDataMode> {
        let result = self.handle_mut()?.output_data_mode();
        self.check(result)
    }

    /// Fetch a spectrum as a command response.
    pub fn download_spectrum(&mut self, kind: SpectrumType, channel: u32) -> AppResult<Response> {
        self.require(OperationMode::Blocking, "download_spectrum")?;
        let result = self.handle_mut()?.download_spectrum(kind, channel);
        let raw = self.check(result)?;
        let library = Arc::clone(&self.library);
        Response::decode(&raw).into_result(|c| library.error_string(c))
    }

    /// Pending library error texts.
    pub fn last_errors(&mut self) -> AppResult<Vec<String>> {
        let result = self.handle_mut()?.last_errors();
        self.check(result)
    }

    /// Drop pending library errors.
    pub fn clear_errors(&mut self) -> AppResult<()> {
        let result = self.handle_mut()?.clear_errors();
        self.check(result)
    }

    // ===== Auto buffer =====

    /// Hand the device a buffer sized for `sample_count` samples.
    ///
    /// Returns the granted size in bytes. Errors from the library's size query
    /// are returned as they are.
    pub fn activate_auto_buffer(&mut self, sample_count: usize, flush_first: bool) -> AppResult<usize> {
        if sample_count == 0 {
            return Err(DaqError::State("auto buffer needs at least one sample".into()));
        }
        if self.auto_buffer.is_some() {
            self.deactivate_auto_buffer()?;
        }
        if flush_first {
            self.flush()?;
        }
        let catalog = self.refresh_catalog()?;
        let mode = self.output_data_mode()?;
        let width = self.sample_width()?;
        let len = auto_buffer_len(width, sample_count, mode);

        let size = self.handle_mut()?.auto_buffer_size(sample_count);
        let required = self.check(size)?;
        if len < required {
            return Err(DaqError::Protocol(format!(
                "Incorrect auto buffer size: {len} bytes allocated, library requires {required}"
            )));
        }

        let region: AutoBufferRegion = Arc::new(Mutex::new(vec![0u8; len]));
        let result = self
            .handle_mut()?
            .activate_auto_buffer(Arc::clone(&region), sample_count);
        self.check(result)?;
        debug!(sample_count, width, len, "auto buffer activated");
        self.async_flags.reactivate.store(false, Ordering::Release);
        self.auto_buffer = Some(AutoBuffer {
            region,
            sample_count,
            width,
            mode,
            catalog,
            read_cursor: 0,
        });
        Ok(len)
    }

    /// Stop the auto buffer. A no-op when none is active.
    pub fn deactivate_auto_buffer(&mut self) -> AppResult<()> {
        if self.auto_buffer.take().is_none() {
            return Ok(());
        }
        let result = self.handle_mut()?.deactivate_auto_buffer();
        self.check(result)?;
        debug!("auto buffer deactivated");
        Ok(())
    }

    /// An auto buffer is filling or full.
    pub fn auto_buffer_active(&self) -> bool {
        self.auto_buffer.is_some()
    }

    /// Samples saved into the auto buffer so far.
    pub fn saved_sample_count(&mut self) -> AppResult<usize> {
        let result = self.handle_mut()?.saved_sample_count();
        self.check(result)
    }

    /// Status of the active auto buffer.
    pub fn auto_buffer_status(&mut self) -> AppResult<AutoBufferStatus> {
        let result = self.handle_mut()?.auto_buffer_status();
        let code = self.check(result)?;
        AutoBufferStatus::from_code(code)
    }

    /// Samples `from..to` of the active auto buffer.
    pub fn auto_buffer_samples(&mut self, from: usize, to: usize) -> AppResult<SampleBatch> {
        let buffer = self
            .auto_buffer
            .as_ref()
            .ok_or_else(|| DaqError::State("auto buffer is not active".into()))?;
        let to = to.min(buffer.sample_count);
        let from = from.min(to);
        let data = {
            let region = buffer.region.lock();
            let end = (to * buffer.width).min(region.len());
            Bytes::copy_from_slice(&region[(from * buffer.width).min(end)..end])
        };
        Ok(SampleBatch {
            status: ReadStatus::Success,
            sample_count: to - from,
            mode: buffer.mode,
            data,
            catalog: Arc::clone(&buffer.catalog),
        })
    }

    /// Samples saved since the previous call; `None` when nothing new arrived.
    ///
    /// Fails when the device reports [`AutoBufferStatus::Error`] for the buffer.
    pub fn new_auto_buffer_samples(&mut self) -> AppResult<Option<SampleBatch>> {
        if self.auto_buffer.is_none() {
            return Err(DaqError::State("auto buffer is not active".into()));
        }
        if self.auto_buffer_status()? == AutoBufferStatus::Error {
            return Err(DaqError::transport(
                AutoBufferStatus::Error.code(),
                "device reported an auto buffer error",
            ));
        }
        let saved = self.saved_sample_count()?;
        let from = match &self.auto_buffer {
            Some(buffer) => buffer.read_cursor,
            None => return Err(DaqError::State("auto buffer is not active".into())),
        };
        if saved <= from {
            return Ok(None);
        }
        let batch = self.auto_buffer_samples(from, saved)?;
        if let Some(buffer) = self.auto_buffer.as_mut() {
            buffer.read_cursor = from + batch.sample_count;
        }
        Ok(Some(batch))
    }

    /// Whether the device flagged the auto buffer for reactivation.
    pub fn auto_buffer_service_pending(&self) -> bool {
        self.config.async_auto_buffer && self.async_flags.reactivate.load(Ordering::Acquire)
    }

    /// Reactivate the auto buffer of a non-blocking link after the device
    /// reported a format change or a full buffer. Returns whether it did.
    pub fn service_auto_buffer(&mut self) -> AppResult<bool> {
        if !self.config.async_auto_buffer
            || !self.async_flags.reactivate.swap(false, Ordering::AcqRel)
        {
            return Ok(false);
        }
        let Some(count) = self.auto_buffer.as_ref().map(|b| b.sample_count) else {
            return Ok(false);
        };
        if !self.config.async_auto_activate {
            debug!("auto buffer full, reactivation disabled");
            return Ok(false);
        }
        self.activate_auto_buffer(count, false)?;
        Ok(true)
    }

    // ===== Close =====

    /// Wait for outstanding tickets, then release the handle.
    ///
    /// Fails with [`DaqError::Timeout`] once `close_timeout` passes with
    /// tickets still pending; the handle stays open in that case.
    pub fn close(&mut self) -> AppResult<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        if self.mode == OperationMode::NonBlocking {
            self.wait_for_tickets()?;
        }
        if let Err(e) = self.deactivate_auto_buffer() {
            warn!("auto buffer deactivation on close failed: {e}");
        }
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle.close();
        self.check(result)?;
        info!(address = %self.config.address, mode = ?self.mode, "connection closed");
        Ok(())
    }

    fn wait_for_tickets(&self) -> AppResult<()> {
        let deadline = Instant::now() + self.config.close_timeout;
        loop {
            let outstanding = self.tickets.outstanding();
            if outstanding == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DaqError::Timeout(format!(
                    "{outstanding} ticket(s) still pending after {:?}",
                    self.config.close_timeout
                )));
            }
            debug!(outstanding, "waiting for pending tickets before close");
            std::thread::sleep(self.config.close_poll.min(deadline - now).max(Duration::from_millis(1)));
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(code) = handle.close() {
                warn!(code, "connection close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_buffer_stride_is_multiple_of_eight() {
        for width in 1..=40 {
            for count in [1usize, 3, 7, 8, 500, 1001] {
                let len = auto_buffer_len(width, count, OutputDataMode::Raw);
                assert_eq!(len % 8, 0);
                assert!(len >= width * count);
                assert!(len < width * count + 8);
            }
        }
        assert_eq!(auto_buffer_len(2, 500, OutputDataMode::Raw), 1000);
        assert_eq!(auto_buffer_len(24, 10, OutputDataMode::Double), 240);
    }

    #[test]
    fn test_ticket_gauge_is_shared() {
        let gauge = TicketGauge::default();
        let other = gauge.clone();
        gauge.set(2);
        assert_eq!(other.outstanding(), 2);
    }
}
