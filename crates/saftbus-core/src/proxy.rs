//! Client-side handle for one (object path, interface) pair.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::rc::{Rc, Weak};
use std::sync::Mutex;

use saftbus_frame::{FrameError, FrameReader, MessageType};
use saftbus_serial::{ArgReader, FromValue, Value};
use saftbus_transport::SlotId;
use tracing::{debug, warn};

use crate::call::{
    decode_payload, MethodCall, PropertiesChanged, SignalMessage, SignalRoute,
    INTROSPECTABLE_INTERFACE, OWNED_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};
use crate::connection::{ProxyConnection, SignalTarget};
use crate::context::ClientContext;
use crate::error::Result;
use crate::event_loop::{Dispatch, Priority, SourceId};

/// Handler for one named signal; receives the signal's parameters.
pub type SignalHandler = Rc<dyn Fn(&[Value])>;
/// Handler for property change notifications of the proxy's interface.
pub type PropertiesHandler = Rc<dyn Fn(&PropertiesChanged)>;

// Proxies may be built from any thread the host embeds, so the counter is
// the one piece of client state behind a lock.
static PROXY_COUNTER: Mutex<u64> = Mutex::new(0);

/// Ids are unique per process and carry the connection slot in the low
/// two decimal digits.
fn next_proxy_id(slot: SlotId) -> u64 {
    let mut counter = match PROXY_COUNTER.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *counter += 1;
    *counter * 100 + slot.index() as u64
}

struct ProxyCore {
    id: u64,
    path: String,
    interface: String,
    connection: ProxyConnection,
    report_flight_time: bool,
    handlers: RefCell<Vec<(String, SignalHandler)>>,
    property_handlers: RefCell<Vec<PropertiesHandler>>,
    last_flight_time: Cell<Option<f64>>,
}

impl SignalTarget for ProxyCore {
    fn deliver(&self, signal: &SignalMessage) {
        if signal.object_path != self.path {
            warn!(proxy_id = self.id, path = %signal.object_path, "signal for another object dropped");
            return;
        }

        let flight = signal.flight_time_us();
        self.last_flight_time.set(Some(flight));
        if self.report_flight_time {
            if let Err(err) = self.connection.report_flight_time(flight) {
                warn!(proxy_id = self.id, error = %err, "could not report flight time");
            }
        }

        if signal.interface == PROPERTIES_INTERFACE && signal.name == PROPERTIES_CHANGED {
            let change = match PropertiesChanged::from_params(&signal.params) {
                Ok(change) => change,
                Err(err) => {
                    warn!(proxy_id = self.id, error = %err, "malformed PropertiesChanged dropped");
                    return;
                }
            };
            if change.interface != self.interface {
                warn!(
                    proxy_id = self.id,
                    interface = %self.interface,
                    embedded = %change.interface,
                    "PropertiesChanged for another interface dropped"
                );
                return;
            }
            let handlers: Vec<PropertiesHandler> = self.property_handlers.borrow().clone();
            for handler in handlers {
                handler(&change);
            }
            return;
        }

        if signal.interface != self.interface {
            warn!(proxy_id = self.id, interface = %signal.interface, "signal for another interface dropped");
            return;
        }
        let handlers: Vec<SignalHandler> = self
            .handlers
            .borrow()
            .iter()
            .filter(|(name, _)| *name == signal.name)
            .map(|(_, handler)| handler.clone())
            .collect();
        if handlers.is_empty() {
            debug!(proxy_id = self.id, signal = %signal.name, "no handler connected");
        }
        for handler in handlers {
            handler(&signal.params);
        }
    }
}

/// A remote object as seen through one of its interfaces.
///
/// Construction registers a signal route with the daemon; dropping the
/// proxy removes it again. Handlers run on the context's event loop. In-band
/// signals that arrive while a synchronous call waits for its reply are
/// handled during that wait, before the call returns.
pub struct Proxy {
    core: Rc<ProxyCore>,
    route: SignalRoute,
    source: Option<SourceId>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.core.id)
            .field("path", &self.core.path)
            .field("interface", &self.core.interface)
            .field("route", &self.route)
            .finish()
    }
}

impl Proxy {
    /// Create a proxy using the context's default signal route.
    pub fn new(
        context: &ClientContext,
        path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Result<Self> {
        Self::with_route(context, path, interface, context.config().signal_route)
    }

    pub fn with_route(
        context: &ClientContext,
        path: impl Into<String>,
        interface: impl Into<String>,
        route: SignalRoute,
    ) -> Result<Self> {
        let connection = context.connection()?;
        let core = Rc::new(ProxyCore {
            id: next_proxy_id(connection.slot()),
            path: path.into(),
            interface: interface.into(),
            connection: connection.clone(),
            report_flight_time: context.config().report_flight_time,
            handlers: RefCell::new(Vec::new()),
            property_handlers: RefCell::new(Vec::new()),
            last_flight_time: Cell::new(None),
        });

        let source = match route {
            SignalRoute::Pipe => Some(Self::open_pipe(context, &core)?),
            SignalRoute::Inband => {
                let weak: Weak<ProxyCore> = Rc::downgrade(&core);
                connection.register_inband(&core.path, &core.interface, core.id, weak)?;
                None
            }
        };
        debug!(proxy_id = core.id, path = %core.path, interface = %core.interface, ?route, "proxy registered");
        Ok(Self {
            core,
            route,
            source,
        })
    }

    fn open_pipe(context: &ClientContext, core: &Rc<ProxyCore>) -> Result<SourceId> {
        let (read_end, write_end) = saftbus_transport::pipe()?;
        core.connection
            .register_pipe(&core.path, &core.interface, core.id, write_end.as_fd())?;
        // The daemon holds its own copy now; ours would mask its hangup.
        drop(write_end);

        let mut reader = FrameReader::with_config(File::from(read_end), context.config().frame.clone());
        let fd = reader.get_ref().as_raw_fd();
        let weak = Rc::downgrade(core);
        let id = core.id;
        let source = context
            .event_loop()
            .add_fd(fd, Priority::High, move |_| {
                let Some(core) = weak.upgrade() else {
                    return Dispatch::Remove;
                };
                match reader.read_frame() {
                    Ok(frame) if frame.kind == MessageType::Signal => {
                        match decode_payload::<SignalMessage>(frame.payload) {
                            Ok(signal) => core.deliver(&signal),
                            Err(err) => warn!(proxy_id = id, error = %err, "undecodable signal dropped"),
                        }
                        Dispatch::Continue
                    }
                    Ok(frame) => {
                        warn!(proxy_id = id, kind = %frame.kind, "unexpected frame on signal pipe");
                        Dispatch::Continue
                    }
                    Err(FrameError::ConnectionClosed) => {
                        debug!(proxy_id = id, "signal pipe closed by daemon");
                        Dispatch::Remove
                    }
                    Err(err) => {
                        warn!(proxy_id = id, error = %err, "signal pipe failed");
                        Dispatch::Remove
                    }
                }
            });
        Ok(source)
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn path(&self) -> &str {
        &self.core.path
    }

    pub fn interface(&self) -> &str {
        &self.core.interface
    }

    pub fn route(&self) -> SignalRoute {
        self.route
    }

    pub fn connection(&self) -> &ProxyConnection {
        &self.core.connection
    }

    /// Flight time of the most recently received signal, in microseconds.
    pub fn last_flight_time(&self) -> Option<f64> {
        self.core.last_flight_time.get()
    }

    /// Invoke `method` on the proxy's interface.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call_on(&self.core.interface, method, args)
    }

    fn call_on(&self, interface: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let call = MethodCall::new(self.core.path.as_str(), interface, method, args);
        self.core.connection.call_sync(&call)
    }

    /// Call `method` and decode its single return value.
    pub fn call_returning<T: FromValue>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        single(self.call(method, args)?)
    }

    pub fn get(&self, property: &str) -> Result<Value> {
        self.get_on(&self.core.interface, property)
    }

    fn get_on(&self, interface: &str, property: &str) -> Result<Value> {
        let reply = self.call_on(
            PROPERTIES_INTERFACE,
            "Get",
            vec![Value::Str(interface.to_string()), Value::Str(property.to_string())],
        )?;
        single(reply)
    }

    /// Read a property and convert it to `T`.
    pub fn get_as<T: FromValue>(&self, property: &str) -> Result<T> {
        Ok(T::from_value(self.get(property)?)?)
    }

    pub fn set(&self, property: &str, value: Value) -> Result<()> {
        self.call_on(
            PROPERTIES_INTERFACE,
            "Set",
            vec![
                Value::Str(self.core.interface.clone()),
                Value::Str(property.to_string()),
                value,
            ],
        )?;
        Ok(())
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        let reply = self.call_on(
            PROPERTIES_INTERFACE,
            "GetAll",
            vec![Value::Str(self.core.interface.clone())],
        )?;
        single(reply)
    }

    /// Introspection XML of the remote object.
    pub fn introspect(&self) -> Result<String> {
        single(self.call_on(INTROSPECTABLE_INTERFACE, "Introspect", Vec::new())?)
    }

    /// Take ownership of an ownable object.
    pub fn own(&self) -> Result<()> {
        self.call_on(OWNED_INTERFACE, "Own", Vec::new())?;
        Ok(())
    }

    pub fn disown(&self) -> Result<()> {
        self.call_on(OWNED_INTERFACE, "Disown", Vec::new())?;
        Ok(())
    }

    /// Current owner label; empty when nobody owns the object.
    pub fn owner(&self) -> Result<String> {
        Ok(String::from_value(self.get_on(OWNED_INTERFACE, "Owner")?)?)
    }

    /// Run `handler` for every `name` signal, in connection order.
    pub fn connect_signal(&self, name: impl Into<String>, handler: impl Fn(&[Value]) + 'static) {
        self.core
            .handlers
            .borrow_mut()
            .push((name.into(), Rc::new(handler)));
    }

    pub fn connect_properties_changed(&self, handler: impl Fn(&PropertiesChanged) + 'static) {
        self.core.property_handlers.borrow_mut().push(Rc::new(handler));
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // Unregister first so the server stops writing before our end closes.
        if self.core.connection.is_closed() {
            debug!(proxy_id = self.core.id, "connection gone, nothing to unregister");
        } else if let Err(err) =
            self.core
                .connection
                .unregister(&self.core.path, &self.core.interface, self.core.id)
        {
            warn!(proxy_id = self.core.id, error = %err, "failed to unregister signal route");
        }
        if let Some(source) = self.source.take() {
            self.core.connection.event_loop().remove(source);
        }
    }
}

fn single<T: FromValue>(reply: Vec<Value>) -> Result<T> {
    let mut args = ArgReader::new(&reply);
    let value = args.next()?;
    args.finish()?;
    Ok(value)
}

