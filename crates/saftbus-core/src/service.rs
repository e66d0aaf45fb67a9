//! The service container: registry, owners, signal bus and statistics of one
//! daemon, plus dispatch of method calls against them.
//!
//! A `Service` is a cheap handle; clones share state. It is single-threaded
//! and lives on the event loop's thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use saftbus_serial::{ArgReader, Signature, Value};
use tracing::{debug, info, warn};

use crate::call::{
    CallResult, MethodCall, PropertiesChanged, SignalMessage, INTROSPECTABLE_INTERFACE,
    OWNED_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};
use crate::control::{StateReport, StatusReport, StatsReport};
use crate::error::{CallError, ErrorKind};
use crate::event_loop::EventLoop;
use crate::registry::{ObjectSpec, Registry};
use crate::signal::SignalBus;
use crate::stats::Stats;

/// Identity of one client connection: its slot and a daemon-wide serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId {
    pub slot: u32,
    pub serial: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}.{}", self.slot, self.serial)
    }
}

/// Receives the outcome of one call exactly once.
pub type ReplySink = Box<dyn FnOnce(CallResult)>;

type PluginFactory = Rc<dyn Fn(&Service) -> Result<(), CallError>>;

struct Plugin {
    factory: PluginFactory,
    loaded: bool,
}

struct ServiceInner {
    event_loop: EventLoop,
    registry: RefCell<Registry>,
    owners: RefCell<BTreeMap<String, ConnectionId>>,
    privileged: RefCell<BTreeSet<ConnectionId>>,
    bus: SignalBus,
    stats: RefCell<Stats>,
    logging: Cell<bool>,
    plugins: RefCell<BTreeMap<String, Plugin>>,
    connection_counter: Cell<u64>,
    quit_requested: Cell<bool>,
}

#[derive(Clone)]
pub struct Service {
    inner: Rc<ServiceInner>,
}

/// Non-owning handle, for callbacks stored inside the registry.
#[derive(Clone)]
pub struct WeakService {
    inner: Weak<ServiceInner>,
}

impl WeakService {
    pub fn upgrade(&self) -> Option<Service> {
        self.inner.upgrade().map(|inner| Service { inner })
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("objects", &self.inner.registry.borrow().len())
            .field("connections", &self.inner.connection_counter.get())
            .finish()
    }
}

impl Service {
    pub fn new(event_loop: EventLoop) -> Self {
        Self {
            inner: Rc::new(ServiceInner {
                event_loop,
                registry: RefCell::new(Registry::new()),
                owners: RefCell::new(BTreeMap::new()),
                privileged: RefCell::new(BTreeSet::new()),
                bus: SignalBus::new(),
                stats: RefCell::new(Stats::default()),
                logging: Cell::new(false),
                plugins: RefCell::new(BTreeMap::new()),
                connection_counter: Cell::new(0),
                quit_requested: Cell::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakService {
        WeakService {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    pub fn bus(&self) -> &SignalBus {
        &self.inner.bus
    }

    // --- objects ----------------------------------------------------------

    /// Register an object; returns its index.
    pub fn register(&self, spec: ObjectSpec) -> Result<u32, CallError> {
        let path = spec.path().to_string();
        let index = self.inner.registry.borrow_mut().register(spec)?;
        info!(%path, index, "object registered");
        Ok(index)
    }

    /// Remove the object at `path`. Ownable objects announce `Destroyed`
    /// to their subscribers first.
    pub fn remove_object(&self, path: &str) -> Result<(), CallError> {
        let ownable = self.inner.registry.borrow().is_ownable(path);
        if !self.inner.registry.borrow().contains(path) {
            return Err(CallError::new(
                ErrorKind::NoSuchObject,
                format!("no object at {path}"),
            ));
        }
        if ownable {
            self.emit_signal(path, OWNED_INTERFACE, "Destroyed", Vec::new());
        }
        let removed = self.inner.registry.borrow_mut().remove(path);
        self.inner.bus.remove_path(path);
        self.inner.owners.borrow_mut().remove(path);
        if let Some(removed) = removed {
            info!(%path, index = removed.index, interfaces = ?removed.interfaces, "object removed");
            if let Some(hook) = removed.on_removed {
                hook(self);
            }
        }
        Ok(())
    }

    pub fn has_object(&self, path: &str) -> bool {
        self.inner.registry.borrow().contains(path)
    }

    /// Paths equal to `prefix` or nested below it.
    pub fn object_paths_under(&self, prefix: &str) -> Vec<String> {
        self.inner.registry.borrow().paths_under(prefix)
    }

    pub fn introspect(&self, path: &str) -> Result<String, CallError> {
        self.inner.registry.borrow().introspect(path)
    }

    // --- signals ----------------------------------------------------------

    /// Emit a signal to every proxy subscribed to (`interface`, `path`).
    pub fn emit_signal(&self, path: &str, interface: &str, name: &str, params: Vec<Value>) -> usize {
        let signal = SignalMessage::now(path, interface, name, params);
        let delivered = self.inner.bus.emit(&signal);
        debug!(%path, %interface, signal = %name, delivered, "signal emitted");
        delivered
    }

    /// Announce changed property values of `interface` at `path`.
    pub fn properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: BTreeMap<String, Value>,
    ) -> usize {
        let params = PropertiesChanged {
            interface: interface.to_string(),
            changed,
            invalidated: Vec::new(),
        }
        .into_params();
        self.emit_signal(path, PROPERTIES_INTERFACE, PROPERTIES_CHANGED, params)
    }

    // --- ownership --------------------------------------------------------

    pub fn owner(&self, path: &str) -> Option<ConnectionId> {
        self.inner.owners.borrow().get(path).copied()
    }

    /// Set or clear the owner of `path` and announce the change.
    pub fn set_owner(&self, path: &str, owner: Option<ConnectionId>) {
        let previous = match owner {
            Some(id) => self.inner.owners.borrow_mut().insert(path.to_string(), id),
            None => self.inner.owners.borrow_mut().remove(path),
        };
        if previous == owner {
            return;
        }
        debug!(%path, owner = ?owner.map(|o| o.to_string()), "owner changed");
        let mut changed = BTreeMap::new();
        changed.insert("Owner".to_string(), Value::Str(owner_string(owner)));
        self.properties_changed(path, OWNED_INTERFACE, changed);
    }

    fn require_owner(&self, path: &str, caller: Option<ConnectionId>) -> Result<(), CallError> {
        match (self.owner(path), caller) {
            (Some(owner), Some(caller)) if owner == caller => Ok(()),
            (Some(owner), _) => Err(CallError::permission_denied(format!(
                "{path} is owned by {owner}"
            ))),
            (None, _) => Err(CallError::permission_denied(format!(
                "{path} must be owned by the caller"
            ))),
        }
    }

    // --- connections ------------------------------------------------------

    /// Allocate the identity of a new connection on `slot`.
    pub fn connection_opened(&self, slot: u32, privileged: bool) -> ConnectionId {
        let serial = self.inner.connection_counter.get() + 1;
        self.inner.connection_counter.set(serial);
        let id = ConnectionId { slot, serial };
        if privileged {
            self.inner.privileged.borrow_mut().insert(id);
        }
        id
    }

    /// Tear down everything `id` left behind: its signal routes first, then
    /// its ownerships, running each object's owner-quit hook.
    pub fn connection_closed(&self, id: ConnectionId) {
        let routes = self.inner.bus.remove_connection(id);
        self.inner.privileged.borrow_mut().remove(&id);
        let orphaned: Vec<String> = self
            .inner
            .owners
            .borrow()
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        info!(connection = %id, routes, orphaned = orphaned.len(), "connection closed");

        for path in orphaned {
            self.set_owner(&path, None);
            let hook = self.inner.registry.borrow().owner_quit_hook(&path);
            if let Some(hook) = hook {
                info!(%path, "owner quit, running cleanup");
                hook(self);
            }
        }
    }

    pub fn is_privileged(&self, caller: Option<ConnectionId>) -> bool {
        match caller {
            None => true,
            Some(id) => self.inner.privileged.borrow().contains(&id),
        }
    }

    // --- control ----------------------------------------------------------

    pub fn set_logging(&self, enabled: bool) {
        self.inner.logging.set(enabled);
        info!(enabled, "call logging");
    }

    pub fn logging(&self) -> bool {
        self.inner.logging.get()
    }

    pub fn set_stats_enabled(&self, enabled: bool) {
        self.inner.stats.borrow_mut().set_enabled(enabled);
        info!(enabled, "statistics");
    }

    pub fn stats_enabled(&self) -> bool {
        self.inner.stats.borrow().enabled()
    }

    pub fn record_flight_time(&self, micros: f64) {
        self.inner.stats.borrow_mut().record_flight_time(micros);
    }

    pub fn stats_report(&self) -> StatsReport {
        self.inner.stats.borrow().report()
    }

    /// Make `name` loadable through LOAD_PLUGIN.
    pub fn register_plugin(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&Service) -> Result<(), CallError> + 'static,
    ) {
        self.inner.plugins.borrow_mut().insert(
            name.into(),
            Plugin {
                factory: Rc::new(factory),
                loaded: false,
            },
        );
    }

    pub fn load_plugin(&self, name: &str) -> Result<(), CallError> {
        let factory = {
            let plugins = self.inner.plugins.borrow();
            let plugin = plugins
                .get(name)
                .ok_or_else(|| CallError::invalid_args(format!("unknown plugin '{name}'")))?;
            if plugin.loaded {
                return Err(CallError::new(
                    ErrorKind::DuplicateName,
                    format!("plugin '{name}' already loaded"),
                ));
            }
            Rc::clone(&plugin.factory)
        };
        factory(self)?;
        if let Some(plugin) = self.inner.plugins.borrow_mut().get_mut(name) {
            plugin.loaded = true;
        }
        info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Stop the event loop after the current iteration.
    pub fn request_quit(&self) {
        info!("quit requested");
        self.inner.quit_requested.set(true);
        self.inner.event_loop.quit();
    }

    pub fn quit_requested(&self) -> bool {
        self.inner.quit_requested.get()
    }

    pub fn status_report(&self) -> StatusReport {
        let stats = self.inner.stats.borrow().report();
        StatusReport {
            indices: self.inner.registry.borrow().index_table(),
            active_indices: self.active_indices(),
            stats_enabled: stats.enabled,
            flight_times: stats.flight_times,
            function_times: stats.function_times,
        }
    }

    /// Everything but the socket fields, which only the server knows.
    pub fn state_report(&self) -> StateReport {
        let registry = self.inner.registry.borrow();
        StateReport {
            indices: registry.index_table(),
            active_indices: self.active_indices(),
            object_counter: u64::from(registry.object_counter()),
            signal_counter: self.inner.bus.subscription_counter(),
            sockets_active: Vec::new(),
            socket_owner: BTreeMap::new(),
            proxy_pipes: self.inner.bus.report(),
            connection_counter: self.inner.connection_counter.get(),
            owners: self
                .inner
                .owners
                .borrow()
                .iter()
                .map(|(path, id)| (path.clone(), id.to_string()))
                .collect(),
            plugins: self
                .inner
                .plugins
                .borrow()
                .iter()
                .map(|(name, plugin)| (name.clone(), plugin.loaded))
                .collect(),
        }
    }

    fn active_indices(&self) -> BTreeSet<u32> {
        let registry = self.inner.registry.borrow();
        self.inner
            .bus
            .active_paths()
            .iter()
            .filter_map(|path| registry.index_of(path))
            .collect()
    }

    // --- dispatch ---------------------------------------------------------

    /// Run `call` on behalf of `caller` and hand the outcome to `reply`,
    /// now or later if the handler defers.
    pub fn dispatch(&self, call: MethodCall, caller: Option<ConnectionId>, reply: ReplySink) {
        if self.logging() {
            info!(
                interface = %call.interface,
                method = %call.method,
                path = %call.object_path,
                caller = %caller.map(|c| c.to_string()).unwrap_or_else(|| "local".into()),
                "call"
            );
        }
        let started = Instant::now();
        let mut ctx = CallContext {
            service: self.clone(),
            caller,
            object_path: call.object_path.clone(),
            interface: call.interface.clone(),
            member: call.method.clone(),
            reply: Some(reply),
        };
        let result = self.route(&mut ctx, &call);
        self.inner
            .stats
            .borrow_mut()
            .record_function(&call.interface, &call.method, started.elapsed());
        ctx.finish(result);
    }

    /// Dispatch an in-process call and collect its reply.
    pub fn call_local(&self, call: MethodCall, caller: Option<ConnectionId>) -> LocalReply {
        let reply = LocalReply::default();
        let slot = reply.clone();
        self.dispatch(call, caller, Box::new(move |result| slot.set(result)));
        reply
    }

    fn route(&self, ctx: &mut CallContext, call: &MethodCall) -> CallResult {
        let path = call.object_path.as_str();
        match call.interface.as_str() {
            PROPERTIES_INTERFACE => self.route_properties(ctx, call),
            INTROSPECTABLE_INTERFACE => match call.method.as_str() {
                "Introspect" => Ok(vec![Value::Str(self.introspect(path)?)]),
                other => Err(no_such_method(INTROSPECTABLE_INTERFACE, other)),
            },
            OWNED_INTERFACE => self.route_owned(ctx, call),
            interface => {
                let resolved =
                    self.inner
                        .registry
                        .borrow()
                        .resolve_method(path, interface, &call.method)?;
                if resolved.owner_only {
                    self.require_owner(path, ctx.caller)?;
                }
                check_args(&resolved.in_sig, &call.args)?;
                (resolved.handler)(ctx, &call.args)
            }
        }
    }

    fn route_properties(&self, ctx: &mut CallContext, call: &MethodCall) -> CallResult {
        let path = call.object_path.as_str();
        let mut args = ArgReader::new(&call.args);
        match call.method.as_str() {
            "Get" => {
                let interface: String = args.next()?;
                let name: String = args.next()?;
                args.finish()?;
                if interface == OWNED_INTERFACE && name == "Owner" && self.is_ownable(path) {
                    return Ok(vec![Value::Str(owner_string(self.owner(path)))]);
                }
                let (entry, _) =
                    self.inner
                        .registry
                        .borrow()
                        .resolve_property(path, &interface, &name)?;
                Ok(vec![(entry.getter)()?])
            }
            "Set" => {
                let interface: String = args.next()?;
                let name: String = args.next()?;
                let value: Value = args.next()?;
                args.finish()?;
                let (entry, owner_only) =
                    self.inner
                        .registry
                        .borrow()
                        .resolve_property(path, &interface, &name)?;
                let Some(setter) = entry.setter else {
                    return Err(CallError::permission_denied(format!(
                        "property {interface}.{name} is read-only"
                    )));
                };
                if owner_only {
                    self.require_owner(path, ctx.caller)?;
                }
                let signature = Signature::parse(&entry.signature)?;
                if !signature.matches(&value) {
                    return Err(CallError::invalid_args(format!(
                        "property {name} expects '{signature}', got {}",
                        value.type_name()
                    )));
                }
                setter(ctx, value)?;
                Ok(Vec::new())
            }
            "GetAll" => {
                let interface: String = args.next()?;
                args.finish()?;
                let mut all = BTreeMap::new();
                if interface == OWNED_INTERFACE && self.is_ownable(path) {
                    all.insert(
                        "Owner".to_string(),
                        Value::Str(owner_string(self.owner(path))),
                    );
                    return Ok(vec![Value::Map(all)]);
                }
                let getters = self.inner.registry.borrow().property_getters(path, &interface)?;
                for (name, getter) in getters {
                    all.insert(name, getter()?);
                }
                Ok(vec![Value::Map(all)])
            }
            other => Err(no_such_method(PROPERTIES_INTERFACE, other)),
        }
    }

    fn route_owned(&self, ctx: &mut CallContext, call: &MethodCall) -> CallResult {
        let path = call.object_path.as_str();
        if !self.is_ownable(path) {
            return Err(CallError::new(
                ErrorKind::NoSuchObject,
                format!("no object {path} with interface {OWNED_INTERFACE}"),
            ));
        }
        ArgReader::new(&call.args).finish()?;
        match call.method.as_str() {
            "Own" => {
                let Some(caller) = ctx.caller else {
                    return Err(CallError::failed("only connected clients can own objects"));
                };
                match self.owner(path) {
                    Some(owner) if owner != caller => Err(CallError::permission_denied(format!(
                        "{path} is already owned by {owner}"
                    ))),
                    _ => {
                        self.set_owner(path, Some(caller));
                        Ok(Vec::new())
                    }
                }
            }
            "Disown" => {
                self.require_owner(path, ctx.caller)?;
                self.set_owner(path, None);
                Ok(Vec::new())
            }
            other => Err(no_such_method(OWNED_INTERFACE, other)),
        }
    }

    fn is_ownable(&self, path: &str) -> bool {
        self.inner.registry.borrow().is_ownable(path)
    }
}

fn owner_string(owner: Option<ConnectionId>) -> String {
    owner.map(|o| o.to_string()).unwrap_or_default()
}

fn no_such_method(interface: &str, method: &str) -> CallError {
    CallError::new(
        ErrorKind::NoSuchMethod,
        format!("no method {interface}.{method}"),
    )
}

/// Check `args` against a concatenated input signature.
fn check_args(in_sig: &str, args: &[Value]) -> Result<(), CallError> {
    let expected = Signature::parse_list(in_sig)?;
    if expected.len() != args.len() {
        return Err(CallError::invalid_args(format!(
            "expected {} argument(s) of '{in_sig}', got {}",
            expected.len(),
            args.len()
        )));
    }
    for (i, (sig, value)) in expected.iter().zip(args).enumerate() {
        if !sig.matches(value) {
            return Err(CallError::invalid_args(format!(
                "argument {i}: expected '{sig}', got {}",
                value.type_name()
            )));
        }
    }
    Ok(())
}

/// What a method handler sees of the call it serves.
pub struct CallContext {
    service: Service,
    caller: Option<ConnectionId>,
    object_path: String,
    interface: String,
    member: String,
    reply: Option<ReplySink>,
}

impl CallContext {
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// The calling connection; `None` for in-process calls.
    pub fn caller(&self) -> Option<ConnectionId> {
        self.caller
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Whether the caller currently owns the called object.
    pub fn is_owner(&self) -> bool {
        self.caller.is_some() && self.service.owner(&self.object_path) == self.caller
    }

    /// Whether the caller may use privileged operations.
    pub fn is_privileged(&self) -> bool {
        self.service.is_privileged(self.caller)
    }

    /// Take over the reply. Whatever the handler returns afterwards is
    /// discarded; the call completes through the returned [`PendingReply`].
    pub fn defer(&mut self) -> PendingReply {
        PendingReply {
            sink: self.reply.take(),
            what: format!("{}.{} at {}", self.interface, self.member, self.object_path),
        }
    }

    fn finish(mut self, result: CallResult) {
        match self.reply.take() {
            Some(sink) => sink(result),
            None => {
                if let Err(err) = result {
                    debug!(error = %err, "deferred handler returned an error");
                }
            }
        }
    }
}

/// A reply to be sent later. Dropping it unanswered replies `Failed`.
pub struct PendingReply {
    sink: Option<ReplySink>,
    what: String,
}

impl PendingReply {
    pub fn complete(mut self, result: CallResult) {
        if let Some(sink) = self.sink.take() {
            sink(result);
        }
    }

    pub fn what(&self) -> &str {
        &self.what
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            warn!(call = %self.what, "deferred reply dropped without an answer");
            sink(Err(CallError::failed("reply abandoned")));
        }
    }
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("what", &self.what)
            .field("answered", &self.sink.is_none())
            .finish()
    }
}

/// Reply slot filled by [`Service::call_local`].
#[derive(Clone, Default)]
pub struct LocalReply(Rc<RefCell<Option<CallResult>>>);

impl LocalReply {
    fn set(&self, result: CallResult) {
        *self.0.borrow_mut() = Some(result);
    }

    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn take(&self) -> Option<CallResult> {
        self.0.borrow_mut().take()
    }
}
