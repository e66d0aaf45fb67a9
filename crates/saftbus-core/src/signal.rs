//! Server-side signal fan-out.
//!
//! Subscribers are kept per (interface, object path). Each holds the route
//! its proxy registered: a private pipe, or the proxy's connection socket.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::ErrorKind;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::{Rc, Weak};

use saftbus_frame::{FrameError, FrameWriter, MessageType};
use tracing::{debug, warn};

use crate::call::{encode_payload, SignalMessage, SignalRoute, PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
use crate::control::PipeEntry;
use crate::service::ConnectionId;

/// Anything a complete frame can be written to, such as a client connection.
pub trait FrameSink {
    fn send_frame(&self, kind: MessageType, payload: &[u8]) -> saftbus_frame::Result<()>;
}

/// Destination of one proxy's signals.
pub enum SignalSink {
    /// Write end of the proxy's signal pipe.
    Pipe(FrameWriter<File>),
    /// The connection the proxy registered on.
    Inband(Weak<dyn FrameSink>),
}

impl SignalSink {
    /// Route to the write end of a proxy's signal pipe.
    ///
    /// The end is switched to non-blocking mode, so a proxy that stops
    /// draining its pipe costs the daemon one failed write, never a stall.
    pub fn pipe(write_end: OwnedFd) -> saftbus_transport::Result<Self> {
        saftbus_transport::set_nonblocking(write_end.as_fd())?;
        Ok(SignalSink::Pipe(FrameWriter::new(File::from(write_end))))
    }

    fn route(&self) -> SignalRoute {
        match self {
            SignalSink::Pipe(_) => SignalRoute::Pipe,
            SignalSink::Inband(_) => SignalRoute::Inband,
        }
    }

    fn write(&mut self, payload: &[u8]) -> saftbus_frame::Result<()> {
        match self {
            SignalSink::Pipe(writer) => writer.send(MessageType::Signal, payload),
            SignalSink::Inband(link) => match link.upgrade() {
                Some(link) => link.send_frame(MessageType::Signal, payload),
                None => Err(FrameError::ConnectionClosed),
            },
        }
    }
}

struct Subscriber {
    proxy_id: u64,
    connection: ConnectionId,
    sink: SignalSink,
}

#[derive(Default)]
struct BusInner {
    subscribers: BTreeMap<(String, String), Vec<Subscriber>>,
    subscription_counter: u64,
}

/// Subscriber table shared by the service and the server.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Rc<RefCell<BusInner>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `proxy_id` for signals of (`interface`, `path`). A repeated
    /// registration of the same proxy replaces its route.
    pub fn subscribe(
        &self,
        interface: &str,
        path: &str,
        proxy_id: u64,
        connection: ConnectionId,
        sink: SignalSink,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.subscription_counter += 1;
        let list = inner
            .subscribers
            .entry((interface.to_string(), path.to_string()))
            .or_default();
        list.retain(|s| s.proxy_id != proxy_id);
        debug!(interface, path, proxy_id, %connection, route = ?sink.route(), "subscribed");
        list.push(Subscriber {
            proxy_id,
            connection,
            sink,
        });
    }

    /// Drop one proxy's route. Returns whether it existed.
    pub fn unsubscribe(&self, interface: &str, path: &str, proxy_id: u64) -> bool {
        let mut inner = self.inner.borrow_mut();
        let key = (interface.to_string(), path.to_string());
        let Some(list) = inner.subscribers.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.proxy_id != proxy_id);
        let removed = list.len() != before;
        if list.is_empty() {
            inner.subscribers.remove(&key);
        }
        if removed {
            debug!(interface, path, proxy_id, "unsubscribed");
        }
        removed
    }

    /// Drop every route registered by `connection`. Returns how many.
    pub fn remove_connection(&self, connection: ConnectionId) -> usize {
        let mut inner = self.inner.borrow_mut();
        let mut removed = 0;
        inner.subscribers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.connection != connection);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Drop every route for `path`, on any interface.
    pub fn remove_path(&self, path: &str) {
        self.inner
            .borrow_mut()
            .subscribers
            .retain(|(_, p), _| p != path);
    }

    /// Write `signal` to every subscriber and return how many received it.
    ///
    /// Property changes are routed by the interface embedded in their first
    /// parameter. A subscriber whose route is gone is removed, and so is one
    /// whose pipe is full: a partly written frame leaves that pipe unusable.
    pub fn emit(&self, signal: &SignalMessage) -> usize {
        let interface = routing_interface(signal);
        let payload = encode_payload(signal);
        let key = (interface.to_string(), signal.object_path.clone());

        let mut inner = self.inner.borrow_mut();
        let Some(list) = inner.subscribers.get_mut(&key) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain_mut(|sub| match sub.sink.write(&payload) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(err) => {
                if is_gone(&err) {
                    warn!(proxy_id = sub.proxy_id, path = %signal.object_path, "signal route closed, dropping subscriber");
                } else if is_full(&err) {
                    warn!(proxy_id = sub.proxy_id, path = %signal.object_path, "signal pipe full, dropping slow subscriber");
                } else {
                    warn!(proxy_id = sub.proxy_id, error = %err, "signal write failed, dropping subscriber");
                }
                false
            }
        });
        if list.is_empty() {
            inner.subscribers.remove(&key);
        }
        delivered
    }

    pub fn subscriber_count(&self, interface: &str, path: &str) -> usize {
        self.inner
            .borrow()
            .subscribers
            .get(&(interface.to_string(), path.to_string()))
            .map_or(0, Vec::len)
    }

    /// Total routes currently registered.
    pub fn route_count(&self) -> usize {
        self.inner.borrow().subscribers.values().map(Vec::len).sum()
    }

    /// Number of subscriptions ever made.
    pub fn subscription_counter(&self) -> u64 {
        self.inner.borrow().subscription_counter
    }

    /// Paths with at least one subscriber.
    pub fn active_paths(&self) -> BTreeSet<String> {
        self.inner
            .borrow()
            .subscribers
            .keys()
            .map(|(_, path)| path.clone())
            .collect()
    }

    /// interface -> path -> routes, for GET_STATE.
    pub fn report(&self) -> BTreeMap<String, BTreeMap<String, Vec<PipeEntry>>> {
        let inner = self.inner.borrow();
        let mut out: BTreeMap<String, BTreeMap<String, Vec<PipeEntry>>> = BTreeMap::new();
        for ((iface, path), list) in &inner.subscribers {
            let entries = list
                .iter()
                .map(|s| PipeEntry {
                    proxy_id: s.proxy_id,
                    route: match s.sink.route() {
                        SignalRoute::Pipe => "pipe".to_string(),
                        SignalRoute::Inband => "inband".to_string(),
                    },
                    connection: s.connection.to_string(),
                })
                .collect();
            out.entry(iface.clone()).or_default().insert(path.clone(), entries);
        }
        out
    }
}

pub(crate) fn routing_interface(signal: &SignalMessage) -> &str {
    if signal.interface == PROPERTIES_INTERFACE && signal.name == PROPERTIES_CHANGED {
        if let Some(derived) = signal.params.first().and_then(|v| v.as_str()) {
            return derived;
        }
    }
    &signal.interface
}

fn is_gone(err: &FrameError) -> bool {
    match err {
        FrameError::ConnectionClosed => true,
        FrameError::Io(e) => matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset),
        _ => false,
    }
}

fn is_full(err: &FrameError) -> bool {
    matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock)
}

/// In-band route to `link`. The bus holds it weakly.
pub(crate) fn inband_sink<T: FrameSink + 'static>(link: &Rc<T>) -> SignalSink {
    let link: Rc<dyn FrameSink> = link.clone();
    SignalSink::Inband(Rc::downgrade(&link))
}
