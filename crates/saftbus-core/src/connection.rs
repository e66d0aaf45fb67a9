//! The client's single connection to the daemon.
//!
//! Synchronous calls and in-band signals share one socket. While a call
//! waits for its reply, signal frames that arrive first are delivered to
//! their handlers right away, in arrival order. A handler running inside
//! such a wait cannot make a blocking call on the same connection: that call
//! fails with [`SaftbusError::ReentrantCall`] instead of stealing the
//! pending reply.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::rc::{Rc, Weak};

use saftbus_frame::{Frame, FrameError, FrameReader, FrameWriter, MessageType};
use saftbus_serial::Value;
use saftbus_transport::{IpcStream, SlotId};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::call::{
    decode_payload, decode_reply, encode_payload, MethodCall, SignalFdRequest, SignalMessage,
    SignalRemoveRequest, SignalRoute,
};
use crate::connector::connect_slot;
use crate::context::ClientConfig;
use crate::control::{PrivilegedRequest, StateReport, StatsReport, StatusReport};
use crate::error::{Result, SaftbusError};
use crate::event_loop::{Dispatch, EventLoop, Priority, SourceId};
use crate::handshake::HandshakeConfig;
use crate::signal::routing_interface;

/// Receiver of signals routed through the connection socket.
pub(crate) trait SignalTarget {
    fn deliver(&self, signal: &SignalMessage);
}

struct InbandRoute {
    /// Id the route is registered under on the server.
    server_proxy_id: u64,
    targets: Vec<(u64, Weak<dyn SignalTarget>)>,
}

struct ConnInner {
    slot: SlotId,
    config: ClientConfig,
    event_loop: EventLoop,
    reader: RefCell<FrameReader<IpcStream>>,
    writer: RefCell<FrameWriter<IpcStream>>,
    inband: RefCell<BTreeMap<(String, String), InbandRoute>>,
    /// Set while a blocking request waits for its answer.
    waiting: Cell<bool>,
    source: Cell<Option<SourceId>>,
    closed: Cell<bool>,
}

/// Handle to the process's connection. Clones share the socket.
#[derive(Clone)]
pub struct ProxyConnection {
    inner: Rc<ConnInner>,
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("slot", &self.inner.slot)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

impl ProxyConnection {
    /// Connect to the first free slot and watch the socket on `event_loop`
    /// for in-band signals.
    pub fn connect(event_loop: &EventLoop, config: ClientConfig) -> Result<Self> {
        let handshake = HandshakeConfig {
            timeout: config.hello_timeout,
            ..HandshakeConfig::default()
        };
        let conn = connect_slot(&config.socket_base, &handshake)?;
        let reader = FrameReader::with_config(conn.stream.try_clone()?, config.frame.clone());
        let writer = FrameWriter::with_config(conn.stream, config.frame.clone());
        let fd = reader.get_ref().as_raw_fd();

        let connection = Self {
            inner: Rc::new(ConnInner {
                slot: conn.slot,
                config,
                event_loop: event_loop.clone(),
                reader: RefCell::new(reader),
                writer: RefCell::new(writer),
                inband: RefCell::new(BTreeMap::new()),
                waiting: Cell::new(false),
                source: Cell::new(None),
                closed: Cell::new(false),
            }),
        };

        let weak = Rc::downgrade(&connection.inner);
        let source = event_loop.add_fd(fd, Priority::High, move |_| match weak.upgrade() {
            Some(inner) => ProxyConnection { inner }.on_idle_readable(),
            None => Dispatch::Remove,
        });
        connection.inner.source.set(Some(source));
        Ok(connection)
    }

    /// Slot this connection occupies on the server.
    pub fn slot(&self) -> SlotId {
        self.inner.slot
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Send `call` and block until its reply arrives.
    ///
    /// An application error from the server comes back as
    /// [`SaftbusError::Call`]; the connection remains usable.
    ///
    /// Fails with [`SaftbusError::ReentrantCall`] when issued from a signal
    /// handler that runs while another request is waiting.
    pub fn call_sync(&self, call: &MethodCall) -> Result<Vec<Value>> {
        let _wait = self.begin_wait()?;
        self.send(MessageType::MethodCall, &encode_payload(call))?;
        let frame = self.wait_for(MessageType::MethodReply)?;
        Ok(decode_reply(frame.payload)??)
    }

    fn begin_wait(&self) -> Result<WaitGuard<'_>> {
        if self.inner.waiting.replace(true) {
            return Err(SaftbusError::ReentrantCall);
        }
        Ok(WaitGuard(&self.inner.waiting))
    }

    fn send(&self, kind: MessageType, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SaftbusError::ConnectionLost);
        }
        let mut writer = self
            .inner
            .writer
            .try_borrow_mut()
            .map_err(|_| SaftbusError::ReentrantCall)?;
        writer.send(kind, payload).map_err(|err| self.lost(err))
    }

    fn send_with_fd(&self, kind: MessageType, payload: &[u8], fd: BorrowedFd<'_>) -> Result<()> {
        if self.is_closed() {
            return Err(SaftbusError::ConnectionLost);
        }
        let mut writer = self
            .inner
            .writer
            .try_borrow_mut()
            .map_err(|_| SaftbusError::ReentrantCall)?;
        writer
            .send_with_fd(kind, payload, fd)
            .map_err(|err| self.lost(err))
    }

    /// Read frames until one of type `kind` arrives, delivering signals as
    /// they come. No borrow is held while a handler runs.
    fn wait_for(&self, kind: MessageType) -> Result<Frame> {
        loop {
            let frame = self.read_frame()?;
            if frame.kind == kind {
                return Ok(frame);
            }
            match frame.kind {
                MessageType::Signal => match decode_payload::<SignalMessage>(frame.payload) {
                    Ok(signal) => self.deliver(&signal),
                    Err(err) => warn!(error = %err, "undecodable signal dropped"),
                },
                other => warn!(expected = %kind, got = %other, "unexpected frame while waiting"),
            }
        }
    }

    fn read_frame(&self) -> Result<Frame> {
        if self.is_closed() {
            return Err(SaftbusError::ConnectionLost);
        }
        let mut reader = self
            .inner
            .reader
            .try_borrow_mut()
            .map_err(|_| SaftbusError::ReentrantCall)?;
        reader.read_frame().map_err(|err| self.lost(err))
    }

    fn lost(&self, err: FrameError) -> SaftbusError {
        self.close();
        match err {
            FrameError::ConnectionClosed | FrameError::Io(_) => {
                warn!(slot = %self.inner.slot, error = %err, "connection lost");
                SaftbusError::ConnectionLost
            }
            other => SaftbusError::Frame(other),
        }
    }

    fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        if let Some(source) = self.inner.source.take() {
            self.inner.event_loop.remove(source);
        }
    }

    fn deliver(&self, signal: &SignalMessage) {
        let key = (
            routing_interface(signal).to_string(),
            signal.object_path.clone(),
        );
        let targets: Vec<Weak<dyn SignalTarget>> = match self.inner.inband.borrow().get(&key) {
            Some(route) => route.targets.iter().map(|(_, t)| t.clone()).collect(),
            None => {
                debug!(path = %signal.object_path, signal = %signal.name, "no in-band receiver");
                return;
            }
        };
        for target in targets.iter().filter_map(Weak::upgrade) {
            target.deliver(signal);
        }
    }

    /// Event-loop callback while no call is pending.
    fn on_idle_readable(&self) -> Dispatch {
        let frame = match self.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "connection watch stopped");
                return Dispatch::Remove;
            }
        };
        match frame.kind {
            MessageType::Signal => match decode_payload::<SignalMessage>(frame.payload) {
                Ok(signal) => self.deliver(&signal),
                Err(err) => warn!(error = %err, "undecodable signal dropped"),
            },
            other => warn!(kind = %other, "unsolicited frame ignored"),
        }
        Dispatch::Continue
    }

    // --- signal routes ----------------------------------------------------

    /// Hand the write end of a signal pipe to the server.
    pub(crate) fn register_pipe(
        &self,
        path: &str,
        interface: &str,
        proxy_id: u64,
        write_end: BorrowedFd<'_>,
    ) -> Result<()> {
        let request = SignalFdRequest {
            object_path: path.to_string(),
            interface: interface.to_string(),
            proxy_id,
            route: SignalRoute::Pipe,
        };
        self.send_with_fd(MessageType::SignalFd, &encode_payload(&request), write_end)
    }

    /// Route signals for (`interface`, `path`) to `target` over the socket.
    /// The server sees one registration per connection and pair.
    pub(crate) fn register_inband(
        &self,
        path: &str,
        interface: &str,
        proxy_id: u64,
        target: Weak<dyn SignalTarget>,
    ) -> Result<()> {
        let key = (interface.to_string(), path.to_string());
        let first = {
            let mut inband = self.inner.inband.borrow_mut();
            let route = inband.entry(key).or_insert_with(|| InbandRoute {
                server_proxy_id: proxy_id,
                targets: Vec::new(),
            });
            route.targets.push((proxy_id, target));
            route.server_proxy_id == proxy_id
        };
        if !first {
            return Ok(());
        }
        let request = SignalFdRequest {
            object_path: path.to_string(),
            interface: interface.to_string(),
            proxy_id,
            route: SignalRoute::Inband,
        };
        self.send(MessageType::SignalFd, &encode_payload(&request))
    }

    /// Stop signal delivery for `proxy_id`.
    pub(crate) fn unregister(&self, path: &str, interface: &str, proxy_id: u64) -> Result<()> {
        let key = (interface.to_string(), path.to_string());
        let server_id = {
            let mut inband = self.inner.inband.borrow_mut();
            match inband.get_mut(&key) {
                Some(route) if route.targets.iter().any(|(id, _)| *id == proxy_id) => {
                    route.targets.retain(|(id, _)| *id != proxy_id);
                    if route.targets.is_empty() {
                        let id = route.server_proxy_id;
                        inband.remove(&key);
                        Some(id)
                    } else {
                        None
                    }
                }
                // Not in-band: the pipe registration carries the proxy's own id.
                _ => Some(proxy_id),
            }
        };
        let Some(server_id) = server_id else {
            return Ok(());
        };
        let request = SignalRemoveRequest {
            object_path: path.to_string(),
            interface: interface.to_string(),
            proxy_id: server_id,
        };
        self.send(MessageType::SignalRemoveFd, &encode_payload(&request))
    }

    pub(crate) fn report_flight_time(&self, micros: f64) -> Result<()> {
        self.send(MessageType::SignalFlightTime, &encode_payload(&micros))
    }

    // --- control requests -------------------------------------------------

    fn request_json<T: DeserializeOwned>(&self, kind: MessageType) -> Result<T> {
        let _wait = self.begin_wait()?;
        self.send(kind, &[])?;
        let frame = self.wait_for(kind)?;
        Ok(serde_json::from_slice(&frame.payload)?)
    }

    pub fn get_state(&self) -> Result<StateReport> {
        self.request_json(MessageType::GetState)
    }

    pub fn status(&self) -> Result<StatusReport> {
        self.request_json(MessageType::Status)
    }

    pub fn get_stats(&self) -> Result<StatsReport> {
        self.request_json(MessageType::GetStats)
    }

    pub fn enable_stats(&self, enabled: bool) -> Result<()> {
        let kind = if enabled {
            MessageType::EnableStats
        } else {
            MessageType::DisableStats
        };
        self.send(kind, &[])
    }

    pub fn enable_logging(&self, enabled: bool) -> Result<()> {
        let kind = if enabled {
            MessageType::EnableLogging
        } else {
            MessageType::DisableLogging
        };
        self.send(kind, &[])
    }

    fn privileged(&self, kind: MessageType, target: Option<&str>) -> Result<()> {
        let payload = match target {
            Some(target) => serde_json::to_vec(&PrivilegedRequest {
                target: target.to_string(),
            })?,
            None => Vec::new(),
        };
        let _wait = self.begin_wait()?;
        self.send(kind, &payload)?;
        let frame = self.wait_for(kind)?;
        decode_reply(frame.payload)??;
        Ok(())
    }

    pub fn remove_object(&self, path: &str) -> Result<()> {
        self.privileged(MessageType::RemoveObject, Some(path))
    }

    pub fn load_plugin(&self, name: &str) -> Result<()> {
        self.privileged(MessageType::LoadPlugin, Some(name))
    }

    /// Ask the daemon to exit.
    pub fn quit(&self) -> Result<()> {
        self.privileged(MessageType::Quit, None)?;
        info!("daemon quit acknowledged");
        Ok(())
    }
}

/// Clears the waiting flag when a blocking request ends, however it ends.
struct WaitGuard<'a>(&'a Cell<bool>);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            self.event_loop.remove(source);
        }
    }
}
