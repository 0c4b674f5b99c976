//! AsyncDispatcher: owns a non-blocking [`DeviceLink`] and its ticket table.
//!
//! Outbound commands arrive on a FIFO intake channel and are issued one at a
//! time. Inbound responses, pushed by the driver callback onto the link's
//! response channel, are drained at a fixed cadence (32 Hz by default). For
//! each one the dispatcher:
//!
//! 1. translates library-internal command ids (`%TRM`, `%ETE`, `%ETP`, `%EPS`)
//!    back to the public vocabulary,
//! 2. settles the ticket: the registered handler runs and the pending count
//!    drops, the entry going away at zero,
//! 3. publishes a console line, and hands unclaimed responses to the general
//!    event stream.
//!
//! The ticket table is touched only by the dispatcher task. The outstanding
//! count is mirrored into the link's [`TicketGauge`] so
//! [`DeviceLink::close`] can wait for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{period_of, AcquisitionSettings};
use crate::decoder::SampleBatch;
use crate::driver::DeviceLibrary;
use crate::error::{AppResult, DaqError};
use crate::link::{DeviceLink, LinkInbound, TicketGauge};
use crate::protocol::ids::{cmd, etr, OperationMode};
use crate::protocol::{Arg, Command, CommandId, RawResponse, Response, ResponseArg, Ticket};

/// Continuation run for each response delivered on a ticket.
pub type ResponseHandler = Box<dyn FnMut(&Response) + Send>;

const INTAKE_CAPACITY: usize = 64;

// ===== Ticket table =====

struct PendingTicket {
    pending: u32,
    handler: Option<ResponseHandler>,
}

/// What happened to a response offered to the [`TicketTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// A registered handler consumed it.
    Handled,
    /// The ticket is known but has no handler of its own.
    Unclaimed,
    /// No entry for this ticket.
    Unknown,
}

/// Outstanding tickets and their continuations.
pub struct TicketTable {
    entries: HashMap<Ticket, PendingTicket>,
    gauge: TicketGauge,
}

impl TicketTable {
    /// Empty table that mirrors its size into `gauge`.
    pub fn new(gauge: TicketGauge) -> Self {
        Self {
            entries: HashMap::new(),
            gauge,
        }
    }

    /// Expect `deliveries` more responses on `ticket`.
    ///
    /// Registering a ticket that is already pending adds to its count; a new
    /// handler replaces the old one.
    pub fn expect(&mut self, ticket: Ticket, deliveries: u32, handler: Option<ResponseHandler>) {
        if deliveries == 0 {
            return;
        }
        let entry = self.entries.entry(ticket).or_insert(PendingTicket {
            pending: 0,
            handler: None,
        });
        entry.pending += deliveries;
        if handler.is_some() {
            entry.handler = handler;
        }
        self.publish();
    }

    /// Expect one response for `ticket`.
    pub fn register(&mut self, ticket: Ticket, handler: Option<ResponseHandler>) {
        self.expect(ticket, 1, handler);
    }

    /// Responses still owed for `ticket`.
    pub fn pending(&self, ticket: Ticket) -> Option<u32> {
        self.entries.get(&ticket).map(|e| e.pending)
    }

    /// Outstanding tickets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No outstanding tickets.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Settle one delivery for the response's ticket.
    pub fn resolve(&mut self, response: &Response) -> Settlement {
        let ticket = response.ticket;
        let Some(entry) = self.entries.get_mut(&ticket) else {
            return Settlement::Unknown;
        };
        let settlement = match entry.handler.as_mut() {
            Some(handler) => {
                handler(response);
                Settlement::Handled
            }
            None => Settlement::Unclaimed,
        };
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 {
            self.entries.remove(&ticket);
        }
        self.publish();
        settlement
    }

    /// Drop every entry; used when the connection goes away.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.publish();
    }

    fn publish(&self) {
        let outstanding = self.entries.values().map(|e| e.pending as usize).sum();
        self.gauge.set(outstanding);
    }
}

// ===== Translation =====

/// Outcome of translating an inbound response.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// Response in the public vocabulary.
    Public(Response),
    /// Library-internal echo with no public counterpart.
    Suppressed,
    /// The device announced it is closing the connection.
    PeerClosing,
}

/// Encoder-trigger index to its argument position in an `%ETP` response.
fn etp_argument(index: i32) -> Option<usize> {
    match index {
        etr::START => Some(1),
        etr::STOP => Some(2),
        etr::INTERVAL => Some(3),
        etr::ON_RETURN => Some(4),
        etr::AXIS => Some(0),
        _ => None,
    }
}

/// Maps library-internal responses back to the commands a caller issued.
#[derive(Debug, Default)]
pub struct Translator {
    queries: HashSet<Ticket>,
    pending_etr: VecDeque<i32>,
}

impl Translator {
    /// Record what a command issued on `ticket` implies for later responses.
    pub fn note_outgoing(&mut self, command: &Command, ticket: Ticket) {
        if command.is_query() {
            self.queries.insert(ticket);
        }
        if command.id() == cmd::ENCODER_TRIGGER {
            if let Some(Arg::Int(index)) = command.args().first() {
                if etp_argument(*index).is_some() || *index == etr::ENDLESS {
                    self.pending_etr.push_back(*index);
                }
            }
        }
    }

    /// Whether `ticket` was issued as a query. Clears the mark.
    pub fn take_query_mark(&mut self, ticket: Ticket) -> bool {
        self.queries.remove(&ticket)
    }

    /// Forget every mark; used when the connection goes away.
    pub fn clear(&mut self) {
        self.queries.clear();
        self.pending_etr.clear();
    }

    /// Turn one response into the event it implies.
    pub fn translate(&mut self, response: Response) -> Translation {
        if response.error_code < 0 {
            return Translation::Public(response);
        }
        match response.command_id {
            cmd::DEVICE_TRIGGER_MODE => {
                let public = match response.args.first().and_then(ResponseArg::as_i64) {
                    Some(0) => cmd::TRIGGER_CONTINUOUS,
                    Some(1) => cmd::TRIGGER_WAIT,
                    Some(2) => cmd::TRIGGER_EACH,
                    _ => return Translation::Public(response),
                };
                Translation::Public(rewrite(response, public, Vec::new()))
            }
            cmd::ENCODER_TRIGGER_ENABLED => {
                let mut args = vec![ResponseArg::Int(etr::ENABLE)];
                args.extend(response.args.first().cloned());
                Translation::Public(rewrite(response, cmd::ENCODER_TRIGGER, args))
            }
            cmd::ENCODER_TRIGGER_PROPERTY => self.translate_property(response),
            cmd::ENCODER_COUNTER => {
                let args = response.args.iter().take(2).cloned().collect();
                Translation::Public(rewrite(response, cmd::ENCODER_POSITION, args))
            }
            cmd::MESSAGE => {
                let closing = response
                    .args
                    .get(3)
                    .and_then(ResponseArg::as_str)
                    .is_some_and(|text| text.contains("closing connection"));
                if closing {
                    Translation::PeerClosing
                } else {
                    Translation::Public(response)
                }
            }
            _ => Translation::Public(response),
        }
    }

    fn translate_property(&mut self, response: Response) -> Translation {
        let mapped = self
            .pending_etr
            .iter()
            .position(|i| etp_argument(*i).is_some());
        if let Some(pos) = mapped {
            let Some(index) = self.pending_etr.remove(pos) else {
                return Translation::Public(response);
            };
            let mut args = vec![ResponseArg::Int(index)];
            if let Some(value) = etp_argument(index).and_then(|a| response.args.get(a)) {
                args.push(value.clone());
            }
            return Translation::Public(rewrite(response, cmd::ENCODER_TRIGGER, args));
        }
        if let Some(pos) = self.pending_etr.iter().position(|i| *i == etr::ENDLESS) {
            self.pending_etr.remove(pos);
            return Translation::Suppressed;
        }
        Translation::Public(response)
    }
}

fn rewrite(mut response: Response, id: CommandId, args: Vec<ResponseArg>) -> Response {
    response.command_id = id;
    response.param_count = args.len();
    response.args = args;
    response
}

// ===== Dispatcher task =====

/// Output of the dispatcher for the rest of the session.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Rendered response for the command console.
    Console(String),
    /// Response no ticket handler claimed.
    Response(Response),
    /// The device reported a new scan rate.
    ScanRate(f64),
    /// Sample block delivered on the non-blocking link.
    Samples(SampleBatch),
    /// The device is about to drop the connection.
    PeerClosing,
}

enum Request {
    Submit {
        command: Command,
        deliveries: u32,
        handler: Option<ResponseHandler>,
        reply: oneshot::Sender<AppResult<Ticket>>,
    },
    Shutdown {
        reply: oneshot::Sender<AppResult<()>>,
    },
}

/// Sending side of a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Request>,
    library: Arc<dyn DeviceLibrary>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl DispatcherHandle {
    fn gone() -> DaqError {
        DaqError::State("dispatcher is not running".into())
    }

    /// Queue a command; resolves once it has been issued.
    pub async fn submit(&self, command: Command, handler: Option<ResponseHandler>) -> AppResult<Ticket> {
        self.submit_expecting(command, 1, handler).await
    }

    /// Queue a command whose ticket will see `deliveries` responses.
    pub async fn submit_expecting(
        &self,
        command: Command,
        deliveries: u32,
        handler: Option<ResponseHandler>,
    ) -> AppResult<Ticket> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Submit {
                command,
                deliveries,
                handler,
                reply,
            })
            .await
            .map_err(|_| Self::gone())?;
        rx.await.map_err(|_| Self::gone())?
    }

    /// Parse `text` as a command and submit it.
    pub async fn submit_text(&self, text: &str) -> AppResult<Ticket> {
        self.submit(Command::parse(text)?, None).await
    }

    /// Issue `command` and wait up to `timeout` for its first response.
    pub async fn query(&self, command: Command, timeout: Duration) -> AppResult<Response> {
        let (tx, rx) = oneshot::channel();
        let mut slot = Some(tx);
        let handler: ResponseHandler = Box::new(move |response: &Response| {
            if let Some(tx) = slot.take() {
                let _ = tx.send(response.clone());
            }
        });
        let id = command.id();
        self.submit(command, Some(handler)).await?;
        let response = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| DaqError::Timeout(format!("no response to {id} within {timeout:?}")))?
            .map_err(|_| Self::gone())?;
        let library = Arc::clone(&self.library);
        response.into_result(|code| library.error_string(code))
    }

    /// Close the link, waiting for outstanding tickets, and stop the task.
    /// Returns once the task has let go of its intake.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Shutdown { reply }).await.is_err() {
            return Ok(());
        }
        let result = rx.await.unwrap_or(Ok(()));
        self.tx.closed().await;
        result
    }

    /// The dispatcher task is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Runs the non-blocking link.
pub struct AsyncDispatcher {
    link: Option<DeviceLink>,
    library: Arc<dyn DeviceLibrary>,
    inbound: LinkInbound,
    table: TicketTable,
    translator: Translator,
    events: mpsc::UnboundedSender<DispatchEvent>,
    drain_period: Duration,
}

impl AsyncDispatcher {
    /// Take ownership of `link` and start the dispatcher task.
    pub fn spawn(
        mut link: DeviceLink,
        settings: &AcquisitionSettings,
    ) -> AppResult<(DispatcherHandle, mpsc::UnboundedReceiver<DispatchEvent>)> {
        if link.mode() != OperationMode::NonBlocking {
            return Err(DaqError::State(
                "dispatcher needs a non-blocking connection".into(),
            ));
        }
        let inbound = link
            .take_inbound()
            .ok_or_else(|| DaqError::State("link inbound channels already taken".into()))?;
        let library = link.library();
        let (tx, rx) = mpsc::channel(INTAKE_CAPACITY);
        let (events, events_rx) = mpsc::unbounded_channel();
        let dispatcher = AsyncDispatcher {
            table: TicketTable::new(link.ticket_gauge()),
            link: Some(link),
            library: Arc::clone(&library),
            inbound,
            translator: Translator::default(),
            events,
            drain_period: period_of(settings.dispatcher_hz),
        };
        tokio::spawn(dispatcher.run(rx));
        Ok((DispatcherHandle { tx, library }, events_rx))
    }

    async fn run(mut self, mut intake: mpsc::Receiver<Request>) {
        info!("async dispatcher started");
        let mut drain = tokio::time::interval(self.drain_period);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = intake.recv() => match request {
                    Some(Request::Submit { command, deliveries, handler, reply }) => {
                        let result = self.issue(command, deliveries, handler);
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown { reply }) => {
                        let result = self.close().await;
                        let _ = reply.send(result);
                        break;
                    }
                    None => {
                        if let Err(e) = self.close().await {
                            warn!("dispatcher close after handles dropped failed: {e}");
                        }
                        break;
                    }
                },
                _ = drain.tick() => self.drain().await,
            }
        }
        info!("async dispatcher stopped");
    }

    fn issue(
        &mut self,
        command: Command,
        deliveries: u32,
        handler: Option<ResponseHandler>,
    ) -> AppResult<Ticket> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DaqError::State("dispatcher link is closed".into()))?;
        let ticket = link.send_async(&command)?;
        self.translator.note_outgoing(&command, ticket);
        debug!(%command, %ticket, "command issued");
        let id = command.id();
        if id != cmd::START_DATA_STREAM && id != cmd::STOP_DATA_STREAM {
            self.table.expect(ticket, deliveries, handler);
        }
        Ok(ticket)
    }

    async fn drain(&mut self) {
        self.drain_responses();
        self.drain_samples();
        self.service_auto_buffer().await;
    }

    /// Reactivation goes through the driver and may block, so it runs off
    /// the dispatcher task.
    async fn service_auto_buffer(&mut self) {
        if !self.link.as_ref().is_some_and(DeviceLink::auto_buffer_service_pending) {
            return;
        }
        let Some(link) = self.link.take() else {
            return;
        };
        let serviced = tokio::task::spawn_blocking(move || {
            let mut link = link;
            let result = link.service_auto_buffer();
            (link, result)
        })
        .await;
        match serviced {
            Ok((link, result)) => {
                self.link = Some(link);
                match result {
                    Ok(true) => debug!("auto buffer reactivated"),
                    Ok(false) => {}
                    Err(e) => warn!("auto buffer reactivation failed: {e}"),
                }
            }
            Err(join) => warn!("auto buffer task failed, link dropped: {join}"),
        }
    }

    fn drain_responses(&mut self) {
        while let Ok(raw) = self.inbound.responses.try_recv() {
            self.handle(raw);
        }
    }

    fn drain_samples(&mut self) {
        while let Ok(raw) = self.inbound.samples.try_recv() {
            let Some(link) = self.link.as_mut() else {
                continue;
            };
            match link.resolve(raw) {
                Ok(batch) => self.emit(DispatchEvent::Samples(batch)),
                Err(e) => warn!("async sample block dropped: {e}"),
            }
        }
    }

    fn handle(&mut self, raw: RawResponse) {
        let decoded = Response::decode(&raw);
        let ticket = decoded.ticket;
        let as_query = self.translator.take_query_mark(ticket);
        let response = match self.translator.translate(decoded.clone()) {
            Translation::Public(response) => response,
            Translation::Suppressed => {
                debug!(%ticket, "internal echo suppressed");
                // Handlers still run so waiters are released.
                self.table.resolve(&decoded);
                return;
            }
            Translation::PeerClosing => {
                info!("device is closing the connection");
                self.table.resolve(&decoded);
                self.emit(DispatchEvent::PeerClosing);
                return;
            }
        };

        let library = Arc::clone(&self.library);
        let line = response.console_line(as_query, |code| library.error_string(code));
        self.emit(DispatchEvent::Console(line));

        if response.command_id == cmd::SCAN_RATE && response.error_code >= 0 {
            if let Some(rate) = response.args.first().and_then(ResponseArg::as_f64) {
                self.emit(DispatchEvent::ScanRate(rate));
            }
        }

        match self.table.resolve(&response) {
            Settlement::Handled => {}
            Settlement::Unclaimed => self.emit(DispatchEvent::Response(response)),
            Settlement::Unknown => {
                if ticket.0 != 0 {
                    debug!("{}", DaqError::Correlation(ticket.0));
                }
                self.emit(DispatchEvent::Response(response));
            }
        }
    }

    fn emit(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            debug!("dispatch event dropped, no listener");
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let mut closing = tokio::task::spawn_blocking(move || {
            let mut link = link;
            let result = link.close();
            (link, result)
        });
        let mut drain = tokio::time::interval(self.drain_period);
        let result = loop {
            tokio::select! {
                joined = &mut closing => break joined,
                _ = drain.tick() => self.drain_responses(),
            }
        };
        self.drain_responses();
        match result {
            Ok((_link, Ok(()))) => {
                self.table.clear();
                self.translator.clear();
                Ok(())
            }
            Ok((link, Err(e))) => {
                warn!(outstanding = self.table.len(), "async link close failed: {e}");
                self.table.clear();
                self.translator.clear();
                drop(link);
                Err(e)
            }
            Err(join) => Err(DaqError::State(format!("close task failed: {join}"))),
        }
    }
}
