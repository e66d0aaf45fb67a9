//! End-to-end tests: a daemon on a background thread, clients in the test
//! thread, talking over real slot sockets.

#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use saftbus_core::{
    connect_slot, CallError, ClientConfig, ClientContext, Dispatch, ErrorKind, EventLoop,
    HandshakeConfig, MethodCall, ObjectSpec, Proxy, SaftbusError, Server, ServerConfig, Service,
    SignalRoute, Vtable,
};
use saftbus_frame::{FrameError, FrameReader};
use saftbus_serial::Value;
use saftbus_transport::{slot_path, SlotId};

const FG_PATH: &str = "/de/gsi/saftlib/tr0/fg_0";
const FG_IFACE: &str = "de.gsi.saftlib.FunctionGenerator";

/// Set by the daemon just before it answers `PingLater`.
static LATER_REPLIED: AtomicBool = AtomicBool::new(false);

fn scratch_base(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "saftbus-it-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join("saftbus_")
}

fn register_fixture(service: &Service) {
    let armed = Rc::new(Cell::new(false));
    let getter_armed = armed.clone();
    let vtable = Vtable::new(FG_IFACE)
        .method("Reset", "", "", |_, _| Ok(Vec::new()))
        .method("Arm", "", "", move |ctx, _| {
            armed.set(true);
            let mut changed = BTreeMap::new();
            changed.insert("Armed".to_string(), Value::Bool(true));
            ctx.service().properties_changed(FG_PATH, FG_IFACE, changed);
            Ok(Vec::new())
        })
        .method("Ping", "", "s", |ctx, _| {
            ctx.service().emit_signal(FG_PATH, FG_IFACE, "Pinged", Vec::new());
            Ok(vec![Value::Str("pong".into())])
        })
        .method("PingLater", "", "s", |ctx, _| {
            ctx.service().emit_signal(FG_PATH, FG_IFACE, "Pinged", Vec::new());
            let mut pending = Some(ctx.defer());
            ctx.service()
                .event_loop()
                .add_timeout(Duration::from_millis(100), move || {
                    if let Some(pending) = pending.take() {
                        LATER_REPLIED.store(true, Ordering::SeqCst);
                        pending.complete(Ok(vec![Value::Str("later".into())]));
                    }
                    Dispatch::Remove
                });
            Ok(Vec::new())
        })
        .method("Fail", "", "", |_, _| Err(CallError::failed("told to fail")))
        .owner_only("Flush")
        .method("Flush", "", "", |_, _| Ok(Vec::new()))
        .property("Armed", "b", move || Ok(Value::Bool(getter_armed.get())))
        .signal("Pinged", "");
    service
        .register(ObjectSpec::new(FG_PATH).interface(vtable).ownable())
        .expect("fixture should register");
}

struct Daemon {
    base: PathBuf,
    handle: Option<JoinHandle<()>>,
}

impl Daemon {
    fn start(tag: &str, slots: usize) -> Self {
        let base = scratch_base(tag);
        let thread_base = base.clone();
        let handle = thread::spawn(move || {
            let service = Service::new(EventLoop::new());
            register_fixture(&service);
            let config = ServerConfig {
                socket_base: thread_base,
                slots,
                ..ServerConfig::default()
            };
            let server = Server::bind(service, config).expect("server should bind");
            server.run().expect("event loop should run");
        });
        let last = SlotId::new(slots - 1).expect("slot count should be valid");
        wait_until(Duration::from_secs(5), || slot_path(&base, last).exists());
        Self {
            base,
            handle: Some(handle),
        }
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            socket_base: self.base.clone(),
            hello_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    fn context(&self) -> ClientContext {
        ClientContext::new(self.config())
    }

    fn stop(mut self) {
        // Slots of clients dropped just before may still be settling.
        let context = self.context();
        let mut connection = None;
        wait_until(Duration::from_secs(5), || {
            connection = context.connection().ok();
            connection.is_some()
        });
        let connection = connection.expect("control connection should open");
        connection.quit().expect("quit should be accepted");
        if let Some(handle) = self.handle.take() {
            handle.join().expect("daemon thread should exit cleanly");
        }
        if let Some(parent) = self.base.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in {limit:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Drive `event_loop` until `done` holds.
fn pump_until(event_loop: &EventLoop, limit: Duration, done: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "events not delivered in {limit:?}");
        event_loop
            .iterate(Some(Duration::from_millis(20)))
            .expect("event loop should iterate");
    }
}

#[test]
fn reset_returns_an_empty_reply() {
    let daemon = Daemon::start("reset", 4);
    {
        let context = daemon.context();
        let proxy = Proxy::new(&context, FG_PATH, FG_IFACE).expect("proxy should connect");
        let reply = proxy.call("Reset", Vec::new()).expect("Reset should succeed");
        assert!(reply.is_empty());
        assert_eq!(proxy.last_flight_time(), None);
    }
    daemon.stop();
}

#[test]
fn application_errors_keep_the_connection() {
    let daemon = Daemon::start("errors", 4);
    {
        let context = daemon.context();
        let proxy = Proxy::new(&context, FG_PATH, FG_IFACE).expect("proxy should connect");

        let err = proxy.call("Fail", Vec::new()).expect_err("Fail should fail");
        assert_eq!(err.call_error().map(|e| e.kind), Some(ErrorKind::Failed));

        let err = proxy.call("Nope", Vec::new()).expect_err("unknown method");
        assert_eq!(err.call_error().map(|e| e.kind), Some(ErrorKind::NoSuchMethod));

        let err = proxy.call("Flush", Vec::new()).expect_err("not the owner");
        assert_eq!(err.call_error().map(|e| e.kind), Some(ErrorKind::PermissionDenied));

        proxy.own().expect("own should succeed");
        proxy.call("Flush", Vec::new()).expect("owner may flush");
        assert!(!proxy.owner().expect("owner should read").is_empty());

        assert!(!proxy.connection().is_closed());
        assert!(proxy.get_as::<bool>("Armed").is_ok());
    }
    daemon.stop();
}

#[test]
fn property_change_reaches_every_subscribed_proxy() {
    let daemon = Daemon::start("fanout", 4);
    {
        let context = daemon.context();
        let first = Proxy::new(&context, FG_PATH, FG_IFACE).expect("first proxy");
        let second = Proxy::new(&context, FG_PATH, FG_IFACE).expect("second proxy");
        assert_ne!(first.id(), second.id());

        let seen: Rc<RefCell<Vec<(u64, Value)>>> = Rc::default();
        for proxy in [&first, &second] {
            let seen = seen.clone();
            let id = proxy.id();
            proxy.connect_properties_changed(move |change| {
                if let Some(value) = change.changed.get("Armed") {
                    seen.borrow_mut().push((id, value.clone()));
                }
            });
        }

        first.call("Arm", Vec::new()).expect("Arm should succeed");
        pump_until(context.event_loop(), Duration::from_secs(2), || {
            seen.borrow().len() == 2
        });

        let seen = seen.borrow();
        assert!(seen.iter().all(|(_, value)| *value == Value::Bool(true)));
        assert!(seen.iter().any(|(id, _)| *id == first.id()));
        assert!(seen.iter().any(|(id, _)| *id == second.id()));
        assert!(first.last_flight_time().is_some_and(|t| t >= 0.0));
        assert!(second.last_flight_time().is_some_and(|t| t >= 0.0));
    }
    daemon.stop();
}

#[test]
fn inband_signal_is_delivered_before_the_call_returns() {
    let daemon = Daemon::start("interleave", 4);
    {
        let context = daemon.context();
        let proxy = Proxy::with_route(&context, FG_PATH, FG_IFACE, SignalRoute::Inband)
            .expect("proxy should connect");
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();
        let log = order.clone();
        proxy.connect_signal("Pinged", move |_| log.borrow_mut().push("signal"));

        let reply = proxy.call("Ping", Vec::new()).expect("Ping should succeed");
        order.borrow_mut().push("reply");

        assert_eq!(reply, vec![Value::Str("pong".into())]);
        assert_eq!(*order.borrow(), vec!["signal", "reply"]);
    }
    daemon.stop();
}

#[test]
fn inband_signal_runs_while_a_deferred_call_waits() {
    let daemon = Daemon::start("deferred", 4);
    {
        let context = daemon.context();
        let proxy = Proxy::with_route(&context, FG_PATH, FG_IFACE, SignalRoute::Inband)
            .expect("proxy should connect");
        let returned = Rc::new(Cell::new(false));
        let seen: Rc<RefCell<Vec<(bool, bool, bool)>>> = Rc::default();
        {
            let returned = returned.clone();
            let seen = seen.clone();
            let connection = proxy.connection().clone();
            proxy.connect_signal("Pinged", move |_| {
                let nested = connection.call_sync(&MethodCall::new(FG_PATH, FG_IFACE, "Reset", vec![]));
                seen.borrow_mut().push((
                    returned.get(),
                    LATER_REPLIED.load(Ordering::SeqCst),
                    matches!(nested, Err(SaftbusError::ReentrantCall)),
                ));
            });
        }

        let reply = proxy.call("PingLater", Vec::new()).expect("PingLater should succeed");
        returned.set(true);

        assert_eq!(reply, vec![Value::Str("later".into())]);
        assert_eq!(*seen.borrow(), vec![(false, false, true)]);
        // The refused nested call left the connection intact.
        assert!(proxy.call("Reset", Vec::new()).is_ok());
    }
    daemon.stop();
}

#[test]
fn inband_proxies_share_one_server_route() {
    let daemon = Daemon::start("shared", 4);
    {
        let context = daemon.context();
        let a = Proxy::with_route(&context, FG_PATH, FG_IFACE, SignalRoute::Inband).expect("a");
        let b = Proxy::with_route(&context, FG_PATH, FG_IFACE, SignalRoute::Inband).expect("b");
        let hits = Rc::new(Cell::new(0));
        for proxy in [&a, &b] {
            let hits = hits.clone();
            proxy.connect_signal("Pinged", move |_| hits.set(hits.get() + 1));
        }
        a.call("Ping", Vec::new()).expect("Ping should succeed");
        assert_eq!(hits.get(), 2);

        let state = context.connection().expect("connection").get_state().expect("state");
        assert_eq!(state.pipe_count(), 1);
        drop(b);
        a.call("Ping", Vec::new()).expect("Ping should succeed");
        assert_eq!(hits.get(), 3);
    }
    daemon.stop();
}

#[test]
fn dropping_a_proxy_removes_its_pipe() {
    let daemon = Daemon::start("cleanup", 4);
    {
        let context = daemon.context();
        let connection = context.connection().expect("connection should open");
        let proxy = Proxy::new(&context, FG_PATH, FG_IFACE).expect("proxy should connect");
        assert_eq!(connection.get_state().expect("state").pipe_count(), 1);

        drop(proxy);
        let state = connection.get_state().expect("state");
        assert_eq!(state.pipe_count(), 0);
        assert!(state.active_indices.is_empty());
    }
    daemon.stop();
}

#[test]
fn full_slot_table_is_resource_exhausted() {
    let daemon = Daemon::start("exhausted", 2);
    let first = daemon.context();
    let second = daemon.context();
    first.connection().expect("slot 0");
    second.connection().expect("slot 1");

    let started = Instant::now();
    let err = daemon
        .context()
        .connection()
        .expect_err("no slot should be free");
    assert!(err.is_resource_exhausted(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // A dropped client frees its slot for the next one.
    drop(second);
    let base = daemon.base.clone();
    wait_until(Duration::from_secs(5), || {
        ClientContext::new(ClientConfig {
            socket_base: base.clone(),
            ..ClientConfig::default()
        })
        .connection()
        .is_ok()
    });

    drop(first);
    daemon.stop();
}

#[test]
fn default_slot_table_refuses_the_client_after_the_last_slot() {
    let slots = ServerConfig::default().slots;
    let daemon = Daemon::start("hundred", slots);
    let clients: Vec<ClientContext> = (0..slots).map(|_| daemon.context()).collect();
    for (index, client) in clients.iter().enumerate() {
        let connection = client
            .connection()
            .unwrap_or_else(|err| panic!("client {index} should get a slot: {err}"));
        assert!(!connection.is_closed());
    }

    let err = daemon
        .context()
        .connection()
        .expect_err("every slot is taken");
    assert!(err.is_resource_exhausted(), "unexpected error: {err}");

    drop(clients);
    daemon.stop();
}

#[test]
fn truncated_frame_drops_only_that_connection() {
    let daemon = Daemon::start("truncated", 4);
    let handshake = HandshakeConfig::default();
    let mut raw = connect_slot(&daemon.base, &handshake).expect("raw client should connect");
    let slot = raw.slot;

    // METHOD_CALL header declaring 10 bytes, followed by only 4.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&10u32.to_le_bytes());
    bytes.extend_from_slice(&[1, 2, 3, 4]);
    raw.stream.write_all(&bytes).expect("write should succeed");
    raw.stream.shutdown().expect("shutdown should succeed");

    let mut reader = FrameReader::new(raw.stream);
    assert!(matches!(reader.read_frame(), Err(FrameError::ConnectionClosed)));

    {
        let context = daemon.context();
        let connection = context.connection().expect("daemon should still serve");
        // The dropped slot is either free again or already reused by us.
        wait_until(Duration::from_secs(5), || {
            connection.slot() == slot
                || connection
                    .get_state()
                    .is_ok_and(|state| !state.sockets_active[slot.index()])
        });
        let state = connection.get_state().expect("state");
        assert!(state.owners.is_empty());
        assert_eq!(state.pipe_count(), 0);
    }
    daemon.stop();
}

#[test]
fn control_requests_report_state_and_stats() {
    let daemon = Daemon::start("control", 4);
    {
        let context = daemon.context();
        let connection = context.connection().expect("connection should open");
        let status = connection.status().expect("status");
        assert_eq!(status.indices[FG_IFACE][FG_PATH], 1);
        assert!(!status.stats_enabled);

        connection.enable_stats(true).expect("enable stats");
        let proxy = Proxy::new(&context, FG_PATH, FG_IFACE).expect("proxy");
        proxy.call("Reset", Vec::new()).expect("Reset");
        let stats = connection.get_stats().expect("stats");
        assert!(stats.enabled);
        assert!(stats.function_times.contains_key(&format!("{FG_IFACE}.Reset")));

        let state = connection.get_state().expect("state");
        assert_eq!(state.sockets_active.len(), 4);
        assert!(state.sockets_active[connection.slot().index()]);
        assert!(state.socket_owner.contains_key(&connection.slot().index()));

        let err = connection
            .remove_object("/de/gsi/saftlib/missing")
            .expect_err("unknown object");
        assert_eq!(err.call_error().map(|e| e.kind), Some(ErrorKind::NoSuchObject));
        let err = connection.load_plugin("nope").expect_err("unknown plugin");
        assert!(matches!(err, SaftbusError::Call(ref e) if e.kind == ErrorKind::InvalidArgs));
    }
    daemon.stop();
}
