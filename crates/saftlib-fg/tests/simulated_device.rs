//! A daemon with the device directory and a simulated device on a
//! background thread, driven through the typed proxies.

#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use saftbus_core::{
    ClientConfig, ClientContext, ErrorKind, EventLoop, MethodCall, Server, ServerConfig, Service,
};
use saftbus_serial::Value;
use saftbus_transport::{slot_path, SlotId};
use saftlib_fg::{
    FgError, FunctionGeneratorProxy, MasterFunctionGeneratorProxy, ParameterSet, Saftd,
    SaftdProxy, SimulatedDriver, SimulatedTiming, MASTER_FG_INTERFACE,
};

const MASTER: &str = "/de/gsi/saftlib/tr0/masterfg";
const SLOTS: usize = 6;

fn scratch_base(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "saftlib-fg-it-{}-{}-{}",
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

struct Daemon {
    base: PathBuf,
    handle: Option<JoinHandle<Leftover>>,
}

/// Channel state read inside the daemon after its loop has stopped.
#[derive(Debug, Default)]
struct Leftover {
    fill_levels: Vec<Value>,
    enabled: Vec<Value>,
}

fn read_master(service: &Service, method: &str) -> Vec<Value> {
    let reply = service.call_local(MethodCall::new(MASTER, MASTER_FG_INTERFACE, method, vec![]), None);
    match reply.take() {
        Some(Ok(values)) => values,
        other => panic!("{method} after shutdown: {other:?}"),
    }
}

impl Daemon {
    fn start(tag: &str, timing: SimulatedTiming) -> Self {
        let base = scratch_base(tag);
        let thread_base = base.clone();
        let handle = thread::spawn(move || {
            let service = Service::new(EventLoop::new());
            let driver = SimulatedDriver {
                channels: 2,
                timing,
                ..SimulatedDriver::default()
            };
            let saftd = Saftd::register(&service, driver).expect("directory should register");
            saftd
                .attach_device("tr0", "/dev/sim0")
                .expect("simulated device should attach");
            let config = ServerConfig {
                socket_base: thread_base,
                slots: SLOTS,
                ..ServerConfig::default()
            };
            let server = Server::bind(service, config).expect("server should bind");
            server.run().expect("event loop should run");
            Leftover {
                fill_levels: read_master(server.service(), "ReadFillLevels"),
                enabled: read_master(server.service(), "ReadEnabled"),
            }
        });
        let last = SlotId::new(SLOTS - 1).expect("slot count should be valid");
        wait_until(Duration::from_secs(5), || slot_path(&base, last).exists());
        Self {
            base,
            handle: Some(handle),
        }
    }

    fn context(&self) -> ClientContext {
        ClientContext::new(ClientConfig {
            socket_base: self.base.clone(),
            hello_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        })
    }

    fn stop(mut self) -> Leftover {
        let context = self.context();
        let mut saftd = None;
        wait_until(Duration::from_secs(5), || {
            saftd = SaftdProxy::new(&context).ok();
            saftd.is_some()
        });
        saftd
            .expect("directory proxy should connect")
            .quit()
            .expect("privileged quit should be accepted");
        let leftover = self
            .handle
            .take()
            .map(|handle| handle.join().expect("daemon thread should exit cleanly"))
            .unwrap_or_default();
        if let Some(parent) = self.base.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
        leftover
    }
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in {limit:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn pump_until(context: &ClientContext, limit: Duration, done: impl Fn() -> bool) {
    let deadline = Instant::now() + limit;
    while !done() {
        assert!(Instant::now() < deadline, "events not delivered in {limit:?}");
        context
            .event_loop()
            .iterate(Some(Duration::from_millis(20)))
            .expect("event loop should iterate");
    }
}

fn data(len: usize) -> ParameterSet {
    ParameterSet {
        coeff_a: vec![1; len],
        coeff_b: vec![-1; len],
        coeff_c: vec![1000; len],
        step: vec![1; len],
        freq: vec![2; len],
        shift_a: vec![0; len],
        shift_b: vec![0; len],
    }
}

fn kind(err: &FgError) -> Option<ErrorKind> {
    match err {
        FgError::Bus(bus) => bus.call_error().map(|call| call.kind),
        FgError::Call(call) => Some(call.kind),
        _ => None,
    }
}

#[test]
fn armed_run_plays_out_and_reports_every_stop() {
    let daemon = Daemon::start("run", SimulatedTiming::default());
    {
        let context = daemon.context();
        let saftd = SaftdProxy::new(&context).expect("directory proxy");
        let devices = saftd.devices().expect("Devices property");
        assert_eq!(devices.get("tr0").map(String::as_str), Some("/de/gsi/saftlib/tr0"));

        let master = MasterFunctionGeneratorProxy::new(&context, MASTER).expect("master proxy");
        assert_eq!(master.read_names().unwrap(), vec!["fg-1-0", "fg-1-1"]);

        let all_stopped = Rc::new(Cell::new(0));
        let counter = all_stopped.clone();
        master.on_all_stopped(move |_| counter.set(counter.get() + 1));
        let stops = Rc::new(RefCell::new(Vec::new()));
        let sink = stops.clone();
        master.on_stopped(move |name, stop| sink.borrow_mut().push((name.to_string(), stop.abort)));

        master.own().expect("own");
        master.set_generate_individual_stop_signals(true).unwrap();
        let low_fill = master
            .append_parameter_sets(&[data(3), data(3)], true, true)
            .expect("arm acknowledgement");
        assert!(low_fill);

        pump_until(&context, Duration::from_secs(5), || {
            all_stopped.get() == 1 && stops.borrow().len() == 2
        });
        let mut stops = stops.borrow().clone();
        stops.sort();
        assert_eq!(
            stops,
            vec![("fg-1-0".to_string(), false), ("fg-1-1".to_string(), false)]
        );
        assert_eq!(master.read_executed_parameter_counts().unwrap(), vec![3, 3]);
        assert_eq!(master.read_fill_levels().unwrap(), vec![0, 0]);
        assert_eq!(master.read_enabled().unwrap(), vec![false, false]);

        let channel = FunctionGeneratorProxy::new(&context, "/de/gsi/saftlib/tr0/fg_1")
            .expect("channel proxy");
        assert_eq!(channel.name().unwrap(), "fg-1-1");
        assert_eq!(channel.executed_parameter_count().unwrap(), 3);
        assert!(!channel.running().unwrap());
    }
    daemon.stop();
}

#[test]
fn owner_rules_and_start_tag_while_enabled() {
    let timing = SimulatedTiming {
        start_delay: None,
        ..SimulatedTiming::default()
    };
    let daemon = Daemon::start("owner", timing);
    {
        let owner_context = daemon.context();
        let master = MasterFunctionGeneratorProxy::new(&owner_context, MASTER).expect("master proxy");
        master.own().expect("own");
        master.set_start_tag(7).expect("start tag while idle");
        assert_eq!(master.start_tag().unwrap(), 7);

        master
            .append_parameter_sets(&[data(2), ParameterSet::default()], true, true)
            .expect("arm acknowledgement");
        assert_eq!(master.read_armed().unwrap(), vec![true, false]);

        let err = master.set_start_tag(8).expect_err("enabled channel refuses");
        assert_eq!(kind(&err), Some(ErrorKind::InvalidArgs));

        let other_context = daemon.context();
        let other = MasterFunctionGeneratorProxy::new(&other_context, MASTER).expect("second proxy");
        let err = other.arm().expect_err("not the owner");
        assert_eq!(kind(&err), Some(ErrorKind::PermissionDenied));
        let err = other.set_start_tag(9).expect_err("setter is owner only");
        assert_eq!(kind(&err), Some(ErrorKind::PermissionDenied));

        master.abort().expect("abort completes");
        wait_until(Duration::from_secs(5), || {
            master.read_enabled().unwrap() == vec![false, false]
        });
    }
    daemon.stop();
}

#[test]
fn losing_the_owner_resets_the_channels() {
    let timing = SimulatedTiming {
        start_delay: None,
        ..SimulatedTiming::default()
    };
    let daemon = Daemon::start("quit", timing);
    {
        let context = daemon.context();
        let master = MasterFunctionGeneratorProxy::new(&context, MASTER).expect("master proxy");
        master.own().expect("own");
        master
            .append_parameter_sets(&[data(5), data(4)], false, false)
            .expect("load");
        assert_eq!(master.read_fill_levels().unwrap(), vec![5, 4]);
    }
    let context = daemon.context();
    let master = MasterFunctionGeneratorProxy::new(&context, MASTER).expect("master proxy");
    wait_until(Duration::from_secs(5), || {
        master.read_fill_levels().unwrap() == vec![0, 0]
    });
    drop(master);
    drop(context);
    daemon.stop();
}

#[test]
fn quitting_the_daemon_resets_owned_channels() {
    let timing = SimulatedTiming {
        start_delay: None,
        ..SimulatedTiming::default()
    };
    let daemon = Daemon::start("shutdown", timing);
    let context = daemon.context();
    let master = MasterFunctionGeneratorProxy::new(&context, MASTER).expect("master proxy");
    master.own().expect("own");
    master
        .append_parameter_sets(&[data(4), data(2)], true, true)
        .expect("arm acknowledgement");
    assert_eq!(master.read_armed().unwrap(), vec![true, true]);
    assert_eq!(master.read_fill_levels().unwrap(), vec![4, 2]);

    // The owner is still connected when the daemon is told to quit.
    let leftover = daemon.stop();
    assert_eq!(
        leftover.fill_levels,
        vec![Value::Seq(vec![Value::UInt64(0), Value::UInt64(0)])]
    );
    assert_eq!(
        leftover.enabled,
        vec![Value::Seq(vec![Value::Bool(false), Value::Bool(false)])]
    );
    drop(master);
    drop(context);
}

#[test]
fn devices_come_and_go_through_the_directory() {
    let daemon = Daemon::start("devices", SimulatedTiming::default());
    {
        let context = daemon.context();
        let saftd = SaftdProxy::new(&context).expect("directory proxy");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        saftd.on_devices_changed(move |devices| {
            sink.borrow_mut().push(devices.keys().cloned().collect::<Vec<_>>())
        });

        let err = saftd.attach_device("tr-1", "/dev/sim1").expect_err("bad name");
        assert_eq!(kind(&err), Some(ErrorKind::InvalidArgs));
        assert_eq!(saftd.attach_device("tr1", "/dev/sim1").unwrap(), "/de/gsi/saftlib/tr1");
        saftd.remove_device("tr0").expect("remove");

        let err = MasterFunctionGeneratorProxy::new(&context, MASTER)
            .and_then(|master| master.read_names())
            .expect_err("removed device is gone");
        assert_eq!(kind(&err), Some(ErrorKind::NoSuchObject));

        pump_until(&context, Duration::from_secs(5), || seen.borrow().len() == 2);
        assert_eq!(
            *seen.borrow(),
            vec![vec!["tr0".to_string(), "tr1".to_string()], vec!["tr1".to_string()]]
        );
        assert!(!saftd.source_version().unwrap().is_empty());
    }
    daemon.stop();
}
