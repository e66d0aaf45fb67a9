//! The daemon side of the bus: slot listeners, one link per client, and
//! the per-frame handling that feeds the [`Service`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use saftbus_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameWriter, MessageType};
use saftbus_transport::{IpcStream, SlotId, DEFAULT_SOCKET_BASE, MAX_SLOTS};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::call::{
    decode_payload, encode_reply, CallResult, MethodCall, SignalFdRequest, SignalRemoveRequest,
    SignalRoute,
};
use crate::control::{PrivilegedRequest, StateReport};
use crate::error::{CallError, ErrorKind, Result, SaftbusError};
use crate::event_loop::{Dispatch, Priority, Readiness, SourceId};
use crate::handshake::{send_hello, HandshakeConfig};
use crate::listener::SlotListeners;
use crate::service::{ConnectionId, Service};
use crate::signal::{inband_sink, FrameSink, SignalSink};

/// Loop passes given to owner-quit work after the clients are closed.
const SHUTDOWN_DRAIN_PASSES: usize = 16;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Slot paths are `<socket_base>NN`.
    pub socket_base: PathBuf,
    /// Number of slots to listen on, at most [`MAX_SLOTS`].
    pub slots: usize,
    /// Permission bits of the socket files.
    pub socket_mode: u32,
    pub frame: FrameConfig,
    /// How long a client may stall in the middle of a frame.
    pub stall_timeout: Duration,
    pub handshake: HandshakeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_base: PathBuf::from(DEFAULT_SOCKET_BASE),
            slots: MAX_SLOTS,
            socket_mode: 0o600,
            frame: FrameConfig::default(),
            stall_timeout: Duration::from_secs(5),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// One connected client.
struct ClientLink {
    id: ConnectionId,
    slot: SlotId,
    pid: Option<u32>,
    reader: RefCell<FrameReader<IpcStream>>,
    writer: RefCell<FrameWriter<IpcStream>>,
    source: Cell<Option<SourceId>>,
}

impl FrameSink for ClientLink {
    fn send_frame(&self, kind: MessageType, payload: &[u8]) -> saftbus_frame::Result<()> {
        let mut writer = self.writer.try_borrow_mut().map_err(|_| {
            FrameError::Io(io::Error::new(io::ErrorKind::WouldBlock, "connection writer busy"))
        })?;
        writer.send(kind, payload)
    }
}

struct ServerInner {
    service: Service,
    config: ServerConfig,
    listeners: RefCell<SlotListeners>,
    listener_sources: RefCell<Vec<Option<SourceId>>>,
    links: RefCell<BTreeMap<SlotId, Rc<ClientLink>>>,
}

/// A running saftbus daemon endpoint. Serves until the event loop stops.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Bind every slot and register the listeners with the service's loop.
    pub fn bind(service: Service, config: ServerConfig) -> Result<Self> {
        let listeners = SlotListeners::bind_all(&config.socket_base, config.slots, config.socket_mode)?;
        let count = listeners.len();
        let server = Self {
            inner: Rc::new(ServerInner {
                service,
                config,
                listeners: RefCell::new(listeners),
                listener_sources: RefCell::new(vec![None; count]),
                links: RefCell::new(BTreeMap::new()),
            }),
        };
        for slot in SlotId::range(count) {
            server.watch_listener(slot);
        }
        Ok(server)
    }

    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.inner.links.borrow().len()
    }

    /// Run the service's event loop until QUIT or [`Service::request_quit`],
    /// then [`Server::shutdown`].
    pub fn run(&self) -> Result<()> {
        self.inner.service.event_loop().run()?;
        self.shutdown()
    }

    /// Stop accepting and close every client as if it had disconnected.
    ///
    /// Each connection's routes are dropped and the owner-quit hooks of the
    /// objects it owned run, so owned hardware is left reset. Work those
    /// hooks schedule with no delay gets a few loop passes to finish.
    pub fn shutdown(&self) -> Result<()> {
        let event_loop = self.inner.service.event_loop();
        for source in self
            .inner
            .listener_sources
            .borrow_mut()
            .iter_mut()
            .filter_map(Option::take)
        {
            event_loop.remove(source);
        }

        let links = std::mem::take(&mut *self.inner.links.borrow_mut());
        for link in links.into_values() {
            info!(slot = %link.slot, connection = %link.id, "closing client at shutdown");
            if let Some(source) = link.source.take() {
                event_loop.remove(source);
            }
            if let Err(err) = link.writer.borrow().get_ref().shutdown() {
                debug!(error = %err, "shutdown of client socket");
            }
            self.inner.service.connection_closed(link.id);
        }

        for _ in 0..SHUTDOWN_DRAIN_PASSES {
            if !event_loop.iterate(Some(Duration::ZERO))? {
                break;
            }
        }
        Ok(())
    }

    /// Full GET_STATE report including the socket table.
    pub fn state_report(&self) -> StateReport {
        let mut report = self.inner.service.state_report();
        report.sockets_active = self.inner.listeners.borrow().occupancy();
        report.socket_owner = self
            .inner
            .links
            .borrow()
            .iter()
            .filter_map(|(slot, link)| link.pid.map(|pid| (slot.index(), pid)))
            .collect();
        report
    }

    fn downgrade(&self) -> Weak<ServerInner> {
        Rc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<ServerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn watch_listener(&self, slot: SlotId) {
        let Some(fd) = self.inner.listeners.borrow().listener_fd(slot) else {
            return;
        };
        let weak = self.downgrade();
        let id = self
            .inner
            .service
            .event_loop()
            .add_fd(fd, Priority::Default, move |_| {
                if let Some(server) = Server::from_weak(&weak) {
                    server.accept(slot);
                }
                Dispatch::Remove
            });
        self.inner.listener_sources.borrow_mut()[slot.index()] = Some(id);
    }

    fn accept(&self, slot: SlotId) {
        self.inner.listener_sources.borrow_mut()[slot.index()] = None;
        let accepted = self.inner.listeners.borrow_mut().accept(slot);
        let stream = match accepted {
            Ok(Some(stream)) => stream,
            Ok(None) => return,
            Err(err) => {
                warn!(%slot, error = %err, "accept failed");
                self.reopen(slot);
                return;
            }
        };
        if let Err(err) = self.open_link(slot, stream) {
            warn!(%slot, error = %err, "connection setup failed");
            self.reopen(slot);
        }
    }

    fn open_link(&self, slot: SlotId, stream: IpcStream) -> Result<()> {
        let creds = stream.peer_credentials();
        let privileged = creds.is_some_and(|(uid, _, _)| uid == 0 || uid == effective_uid());
        let pid = creds.map(|(_, _, pid)| pid);

        let config = &self.inner.config;
        let reader_config = FrameConfig {
            read_timeout: Some(config.stall_timeout),
            ..config.frame.clone()
        };
        let reader = FrameReader::with_config_ipc(stream.try_clone()?, reader_config)?;
        let mut writer = FrameWriter::with_config_ipc(stream, config.frame.clone())?;
        send_hello(&mut writer, slot.index() as u32, &config.handshake)?;

        let id = self.inner.service.connection_opened(slot.index() as u32, privileged);
        let fd = reader.get_ref().as_raw_fd();
        let link = Rc::new(ClientLink {
            id,
            slot,
            pid,
            reader: RefCell::new(reader),
            writer: RefCell::new(writer),
            source: Cell::new(None),
        });

        let weak = self.downgrade();
        let source = self
            .inner
            .service
            .event_loop()
            .add_fd(fd, Priority::Default, move |readiness| {
                match Server::from_weak(&weak) {
                    Some(server) => server.on_readable(slot, readiness),
                    None => Dispatch::Remove,
                }
            });
        link.source.set(Some(source));
        self.inner.links.borrow_mut().insert(slot, link);
        info!(%slot, connection = %id, ?pid, privileged, "client connected");
        Ok(())
    }

    fn on_readable(&self, slot: SlotId, readiness: Readiness) -> Dispatch {
        let Some(link) = self.inner.links.borrow().get(&slot).cloned() else {
            return Dispatch::Remove;
        };
        if !readiness.readable && (readiness.hangup || readiness.error) {
            self.disconnect(&link, "hangup");
            return Dispatch::Remove;
        }

        let read = {
            let mut reader = link.reader.borrow_mut();
            let frame = reader.read_frame();
            let fd = reader.take_fd();
            reader.get_mut().discard_received_fds();
            frame.map(|frame| (frame, fd))
        };
        let outcome = match read {
            Ok((frame, fd)) => self.handle_frame(&link, frame, fd),
            Err(err) => Err(err.into()),
        };
        match outcome {
            Ok(()) => Dispatch::Continue,
            Err(err) => {
                let reason = if err.is_protocol_violation() {
                    format!("protocol violation: {err}")
                } else {
                    err.to_string()
                };
                self.disconnect(&link, &reason);
                Dispatch::Remove
            }
        }
    }

    fn handle_frame(&self, link: &Rc<ClientLink>, frame: Frame, fd: Option<OwnedFd>) -> Result<()> {
        let service = &self.inner.service;
        debug!(slot = %link.slot, kind = %frame.kind, size = frame.payload.len(), "frame");
        match frame.kind {
            MessageType::MethodCall => {
                let weak = Rc::downgrade(link);
                let reply = Box::new(move |result: CallResult| {
                    let Some(link) = weak.upgrade() else {
                        debug!("reply for a closed connection dropped");
                        return;
                    };
                    if let Err(err) = link.send_frame(MessageType::MethodReply, &encode_reply(&result)) {
                        warn!(connection = %link.id, error = %err, "failed to send reply");
                    }
                });
                match decode_payload::<MethodCall>(frame.payload) {
                    Ok(call) => service.dispatch(call, Some(link.id), reply),
                    Err(err) => reply(Err(CallError::new(ErrorKind::DecodeError, err.to_string()))),
                }
            }
            MessageType::SignalFd => {
                let request: SignalFdRequest = decode_payload(frame.payload)?;
                let sink = match request.route {
                    SignalRoute::Pipe => {
                        let fd = fd.ok_or_else(|| {
                            SaftbusError::ProtocolViolation("SIGNAL_FD without a descriptor".into())
                        })?;
                        SignalSink::pipe(fd)?
                    }
                    SignalRoute::Inband => inband_sink(link),
                };
                service.bus().subscribe(
                    &request.interface,
                    &request.object_path,
                    request.proxy_id,
                    link.id,
                    sink,
                );
            }
            MessageType::SignalRemoveFd => {
                let request: SignalRemoveRequest = decode_payload(frame.payload)?;
                service
                    .bus()
                    .unsubscribe(&request.interface, &request.object_path, request.proxy_id);
            }
            MessageType::SignalFlightTime => {
                let micros: f64 = decode_payload(frame.payload)?;
                service.record_flight_time(micros);
            }
            MessageType::GetState => self.send_json(link, frame.kind, &self.state_report())?,
            MessageType::Status => self.send_json(link, frame.kind, &service.status_report())?,
            MessageType::GetStats => self.send_json(link, frame.kind, &service.stats_report())?,
            MessageType::EnableStats => service.set_stats_enabled(true),
            MessageType::DisableStats => service.set_stats_enabled(false),
            MessageType::EnableLogging => service.set_logging(true),
            MessageType::DisableLogging => service.set_logging(false),
            MessageType::RemoveObject | MessageType::LoadPlugin | MessageType::Quit => {
                let result = self.privileged(link, &frame);
                link.send_frame(frame.kind, &encode_reply(&result))?;
                if frame.kind == MessageType::Quit && result.is_ok() {
                    service.request_quit();
                }
            }
            MessageType::MethodReply | MessageType::Signal | MessageType::Hello => {
                warn!(slot = %link.slot, kind = %frame.kind, "unexpected frame from client ignored");
            }
        }
        Ok(())
    }

    fn privileged(&self, link: &ClientLink, frame: &Frame) -> CallResult {
        let service = &self.inner.service;
        if !service.is_privileged(Some(link.id)) {
            return Err(CallError::permission_denied(format!(
                "{} requires root or the daemon's user",
                frame.kind
            )));
        }
        match frame.kind {
            MessageType::Quit => Ok(Vec::new()),
            kind => {
                let request: PrivilegedRequest = serde_json::from_slice(&frame.payload)
                    .map_err(|e| CallError::new(ErrorKind::DecodeError, e.to_string()))?;
                if kind == MessageType::RemoveObject {
                    service.remove_object(&request.target)?;
                } else {
                    service.load_plugin(&request.target)?;
                }
                Ok(Vec::new())
            }
        }
    }

    fn send_json<T: Serialize>(&self, link: &ClientLink, kind: MessageType, report: &T) -> Result<()> {
        let json = serde_json::to_vec(report)?;
        link.send_frame(kind, &json)?;
        Ok(())
    }

    /// Tear a client down and make its slot available again.
    fn disconnect(&self, link: &Rc<ClientLink>, reason: &str) {
        info!(slot = %link.slot, connection = %link.id, %reason, "client disconnected");
        self.inner.links.borrow_mut().remove(&link.slot);
        if let Some(source) = link.source.take() {
            self.inner.service.event_loop().remove(source);
        }
        if let Err(err) = link.writer.borrow().get_ref().shutdown() {
            debug!(error = %err, "shutdown after disconnect");
        }
        self.inner.service.connection_closed(link.id);
        self.reopen(link.slot);
    }

    fn reopen(&self, slot: SlotId) {
        let rebound = self.inner.listeners.borrow_mut().rebind(slot);
        match rebound {
            Ok(()) => self.watch_listener(slot),
            Err(err) => warn!(%slot, error = %err, "could not reopen slot"),
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let event_loop = self.service.event_loop();
        for source in self.listener_sources.borrow_mut().iter_mut().filter_map(Option::take) {
            event_loop.remove(source);
        }
        for link in self.links.borrow().values() {
            if let Some(source) = link.source.take() {
                event_loop.remove(source);
            }
        }
    }
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
