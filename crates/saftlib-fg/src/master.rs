//! The aggregate that drives every channel of a firmware instance at once.
//!
//! Arming is a state machine (`Idle -> ArmRequested -> AllArmed`) advanced
//! by channel events on the normal event loop. A caller that asked to wait
//! for the arm acknowledgement is answered from there, or by a timer when
//! the hardware stays silent.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use saftbus_core::{CallError, Dispatch, EventLoop, ObjectSpec, Service, SourceId, Vtable};
use saftbus_serial::{ArgReader, Value};
use tracing::{debug, info, warn};

use crate::backend::{ParameterSet, StopInfo};
use crate::channel::{ChannelEvent, EventKind, FunctionGenerator};
use crate::error::{FgError, Result};
use crate::events::Subscribers;

pub const MASTER_FG_INTERFACE: &str = "de.gsi.saftlib.MasterFunctionGenerator";

/// Default time to wait for every channel to acknowledge an arm request.
pub const DEFAULT_ARM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Idle,
    ArmRequested,
    AllArmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MasterEventKind {
    AllArmed,
    AllStopped,
    Stopped,
    StartTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    AllArmed,
    AllStopped(u64),
    /// A single channel stopped; only while individual stop signals are on.
    Stopped { name: String, info: StopInfo },
    StartTag(u32),
}

impl MasterEvent {
    pub fn kind(&self) -> MasterEventKind {
        match self {
            MasterEvent::AllArmed => MasterEventKind::AllArmed,
            MasterEvent::AllStopped(_) => MasterEventKind::AllStopped,
            MasterEvent::Stopped { .. } => MasterEventKind::Stopped,
            MasterEvent::StartTag(_) => MasterEventKind::StartTag,
        }
    }
}

/// Completion callback for a wait on the arm acknowledgement or an abort.
pub type Waiter = Box<dyn FnOnce(Result<()>)>;

struct MasterInner {
    channels: Vec<FunctionGenerator>,
    event_loop: EventLoop,
    arm_timeout: Duration,
    state: Cell<ArmState>,
    arm_waiter: RefCell<Option<Waiter>>,
    arm_timer: Cell<Option<SourceId>>,
    abort_waiters: RefCell<Vec<Waiter>>,
    start_tag: Cell<u32>,
    individual_stops: Cell<bool>,
    subscribers: Subscribers<MasterEventKind, MasterEvent>,
}

#[derive(Clone)]
pub struct MasterFunctionGenerator {
    inner: Rc<MasterInner>,
}

impl std::fmt::Debug for MasterFunctionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterFunctionGenerator")
            .field("channels", &self.inner.channels.len())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl MasterFunctionGenerator {
    pub fn new(channels: Vec<FunctionGenerator>, event_loop: EventLoop, arm_timeout: Duration) -> Self {
        let inner = Rc::new(MasterInner {
            channels,
            event_loop,
            arm_timeout,
            state: Cell::new(ArmState::Idle),
            arm_waiter: RefCell::new(None),
            arm_timer: Cell::new(None),
            abort_waiters: RefCell::new(Vec::new()),
            start_tag: Cell::new(0),
            individual_stops: Cell::new(false),
            subscribers: Subscribers::default(),
        });
        for channel in &inner.channels {
            for kind in [EventKind::Armed, EventKind::Running, EventKind::Stopped] {
                let weak = Rc::downgrade(&inner);
                let name = channel.name().to_string();
                channel.subscribe(kind, move |event| {
                    if let Some(inner) = weak.upgrade() {
                        MasterFunctionGenerator { inner }.on_channel_event(&name, event);
                    }
                });
            }
        }
        Self { inner }
    }

    fn from_weak(weak: &Weak<MasterInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn channels(&self) -> &[FunctionGenerator] {
        &self.inner.channels
    }

    pub fn arm_state(&self) -> ArmState {
        self.inner.state.get()
    }

    pub fn start_tag(&self) -> u32 {
        self.inner.start_tag.get()
    }

    pub fn generate_individual_stop_signals(&self) -> bool {
        self.inner.individual_stops.get()
    }

    pub fn set_generate_individual_stop_signals(&self, on: bool) {
        self.inner.individual_stops.set(on);
    }

    pub fn subscribe(&self, kind: MasterEventKind, handler: impl Fn(&MasterEvent) + 'static) {
        self.inner.subscribers.subscribe(kind, Rc::new(handler));
    }

    fn emit(&self, event: MasterEvent) {
        self.inner.subscribers.emit(&event.kind(), &event);
    }

    fn all_armed(&self) -> bool {
        self.inner.channels.iter().all(FunctionGenerator::armed_or_idle)
    }

    fn none_running(&self) -> bool {
        self.inner.channels.iter().all(|fg| !fg.running())
    }

    /// Load one dataset per channel, in channel order; empty datasets are
    /// skipped. With `arm`, every channel holding data is armed.
    ///
    /// Returns true when a loaded channel is below its low-water mark.
    pub fn append_parameter_sets(&self, datasets: Vec<ParameterSet>, arm: bool) -> Result<bool> {
        if datasets.len() > self.inner.channels.len() {
            return Err(FgError::invalid_args("More datasets than function generators"));
        }
        for set in datasets.iter().filter(|set| !set.is_empty()) {
            set.validate()?;
        }
        let mut low_fill = false;
        for (channel, set) in self.inner.channels.iter().zip(&datasets) {
            if !set.is_empty() {
                low_fill |= channel.append_parameter_set(set)?;
            }
        }
        if arm {
            self.inner.state.set(ArmState::ArmRequested);
            for channel in self.inner.channels.iter().filter(|fg| fg.fill_level() > 0) {
                channel.arm()?;
            }
        }
        Ok(low_fill)
    }

    /// Call `waiter` once every channel with data is armed, or with
    /// [`FgError::Timeout`] after the arm timeout.
    pub fn wait_for_arm(&self, waiter: Waiter) {
        if self.all_armed() {
            self.inner.state.set(ArmState::AllArmed);
            waiter(Ok(()));
            return;
        }
        if let Some(previous) = self.inner.arm_waiter.replace(Some(waiter)) {
            previous(Err(FgError::rejected("arm request superseded")));
        }
        self.cancel_arm_timer();
        let weak = Rc::downgrade(&self.inner);
        let timer = self.inner.event_loop.add_timeout(self.inner.arm_timeout, move || {
            if let Some(master) = MasterFunctionGenerator::from_weak(&weak) {
                master.arm_timed_out();
            }
            Dispatch::Remove
        });
        self.inner.arm_timer.set(Some(timer));
    }

    fn arm_timed_out(&self) {
        self.inner.arm_timer.set(None);
        self.inner.state.set(ArmState::Idle);
        warn!(timeout = ?self.inner.arm_timeout, "arm acknowledgement timed out");
        if let Some(waiter) = self.inner.arm_waiter.take() {
            waiter(Err(FgError::Timeout(self.inner.arm_timeout)));
        }
    }

    fn cancel_arm_timer(&self) {
        if let Some(timer) = self.inner.arm_timer.take() {
            self.inner.event_loop.remove(timer);
        }
    }

    /// Arm every channel, ignoring channels that refuse.
    pub fn arm(&self) {
        self.inner.state.set(ArmState::ArmRequested);
        for channel in &self.inner.channels {
            if let Err(err) = channel.arm() {
                debug!(channel = %channel.name(), error = %err, "channel not armed");
            }
        }
    }

    /// Reset every channel and return to `Idle`. A pending arm wait fails.
    pub fn reset(&self) -> Result<()> {
        self.cancel_arm_timer();
        self.inner.state.set(ArmState::Idle);
        if let Some(waiter) = self.inner.arm_waiter.take() {
            waiter(Err(FgError::rejected("Reset while waiting for arm acknowledgement")));
        }
        let mut first_err = None;
        for channel in &self.inner.channels {
            if let Err(err) = channel.reset() {
                warn!(channel = %channel.name(), error = %err, "channel reset failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Reset, then call `waiter` once no channel is running.
    pub fn abort(&self, waiter: Waiter) {
        if let Err(err) = self.reset() {
            waiter(Err(err));
            return;
        }
        if self.none_running() {
            waiter(Ok(()));
        } else {
            self.inner.abort_waiters.borrow_mut().push(waiter);
        }
    }

    pub fn flush(&self) -> Result<()> {
        for channel in &self.inner.channels {
            channel.flush()?;
        }
        Ok(())
    }

    pub fn set_start_tag(&self, tag: u32) -> Result<()> {
        if self.inner.channels.iter().any(FunctionGenerator::enabled) {
            return Err(FgError::invalid_args("FG Enabled, cannot set StartTag"));
        }
        if tag != self.inner.start_tag.get() {
            for channel in &self.inner.channels {
                channel.set_start_tag(tag)?;
            }
            self.inner.start_tag.set(tag);
            self.emit(MasterEvent::StartTag(tag));
        }
        Ok(())
    }

    pub fn read_fill_levels(&self) -> Vec<u64> {
        self.inner.channels.iter().map(FunctionGenerator::fill_level).collect()
    }

    pub fn read_names(&self) -> Vec<String> {
        self.inner.channels.iter().map(|fg| fg.name().to_string()).collect()
    }

    pub fn read_armed(&self) -> Vec<bool> {
        self.inner.channels.iter().map(FunctionGenerator::armed).collect()
    }

    pub fn read_enabled(&self) -> Vec<bool> {
        self.inner.channels.iter().map(FunctionGenerator::enabled).collect()
    }

    pub fn read_executed_parameter_counts(&self) -> Vec<u32> {
        self.inner
            .channels
            .iter()
            .map(FunctionGenerator::executed_parameter_count)
            .collect()
    }

    fn on_channel_event(&self, channel: &str, event: &ChannelEvent) {
        match *event {
            ChannelEvent::Armed(true) => {
                if !self.all_armed() {
                    return;
                }
                self.emit(MasterEvent::AllArmed);
                if self.inner.state.get() == ArmState::ArmRequested {
                    self.inner.state.set(ArmState::AllArmed);
                    self.cancel_arm_timer();
                    if let Some(waiter) = self.inner.arm_waiter.take() {
                        info!("all channels armed");
                        waiter(Ok(()));
                    }
                }
            }
            ChannelEvent::Running(false) => self.settle_aborts(),
            ChannelEvent::Stopped(info) => {
                if self.inner.individual_stops.get() {
                    self.emit(MasterEvent::Stopped {
                        name: channel.to_string(),
                        info,
                    });
                }
                if self.inner.channels.iter().all(|fg| !fg.enabled()) {
                    self.inner.state.set(ArmState::Idle);
                    self.emit(MasterEvent::AllStopped(info.time));
                }
                self.settle_aborts();
            }
            _ => {}
        }
    }

    fn settle_aborts(&self) {
        if !self.none_running() {
            return;
        }
        let waiters = std::mem::take(&mut *self.inner.abort_waiters.borrow_mut());
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Export the aggregate at `path`. Losing the owner resets every channel.
    pub fn register(&self, service: &Service, path: &str) -> std::result::Result<u32, CallError> {
        let weak = service.downgrade();
        for kind in [
            MasterEventKind::AllArmed,
            MasterEventKind::AllStopped,
            MasterEventKind::Stopped,
            MasterEventKind::StartTag,
        ] {
            let weak = weak.clone();
            let path = path.to_string();
            self.subscribe(kind, move |event| {
                if let Some(service) = weak.upgrade() {
                    publish(&service, &path, event);
                }
            });
        }

        let on_quit = self.clone();
        let spec = ObjectSpec::new(path)
            .interface(vtable(self))
            .ownable()
            .on_owner_quit(move |_| {
                if let Err(err) = on_quit.reset() {
                    warn!(error = %err, "reset after owner quit failed");
                }
            });
        service.register(spec)
    }
}

fn publish(service: &Service, path: &str, event: &MasterEvent) {
    match event {
        MasterEvent::AllArmed => {
            service.emit_signal(path, MASTER_FG_INTERFACE, "AllArmed", Vec::new());
        }
        MasterEvent::AllStopped(time) => {
            service.emit_signal(path, MASTER_FG_INTERFACE, "AllStopped", vec![Value::UInt64(*time)]);
        }
        MasterEvent::Stopped { name, info } => {
            service.emit_signal(
                path,
                MASTER_FG_INTERFACE,
                "Stopped",
                vec![
                    Value::Str(name.clone()),
                    Value::UInt64(info.time),
                    Value::Bool(info.abort),
                    Value::Bool(info.hardware_underflow),
                    Value::Bool(info.microcontroller_underflow),
                ],
            );
        }
        MasterEvent::StartTag(tag) => {
            service.emit_signal(path, MASTER_FG_INTERFACE, "StartTag", vec![Value::UInt32(*tag)]);
            let mut changed = BTreeMap::new();
            changed.insert("StartTag".to_string(), Value::UInt32(*tag));
            service.properties_changed(path, MASTER_FG_INTERFACE, changed);
        }
    }
}

/// Zip per-column datasets into one parameter set per channel, reporting
/// the first column whose channel count differs from `coeff_a`.
#[allow(clippy::too_many_arguments)]
pub fn zip_datasets(
    coeff_a: Vec<Vec<i16>>,
    coeff_b: Vec<Vec<i16>>,
    coeff_c: Vec<Vec<i32>>,
    step: Vec<Vec<u8>>,
    freq: Vec<Vec<u8>>,
    shift_a: Vec<Vec<u8>>,
    shift_b: Vec<Vec<u8>>,
) -> Result<Vec<ParameterSet>> {
    let count = coeff_a.len();
    let columns = [
        ("coeff_b", coeff_b.len()),
        ("coeff_c", coeff_c.len()),
        ("step", step.len()),
        ("freq", freq.len()),
        ("shift_a", shift_a.len()),
        ("shift_b", shift_b.len()),
    ];
    if let Some((name, _)) = columns.iter().find(|(_, len)| *len != count) {
        return Err(FgError::invalid_args(format!("{name} fgcount mismatch")));
    }
    let mut sets = Vec::with_capacity(count);
    let mut columns = (
        coeff_b.into_iter(),
        coeff_c.into_iter(),
        step.into_iter(),
        freq.into_iter(),
        shift_a.into_iter(),
        shift_b.into_iter(),
    );
    for coeff_a in coeff_a {
        let (Some(coeff_b), Some(coeff_c), Some(step), Some(freq), Some(shift_a), Some(shift_b)) = (
            columns.0.next(),
            columns.1.next(),
            columns.2.next(),
            columns.3.next(),
            columns.4.next(),
            columns.5.next(),
        ) else {
            break;
        };
        sets.push(ParameterSet {
            coeff_a,
            coeff_b,
            coeff_c,
            step,
            freq,
            shift_a,
            shift_b,
        });
    }
    Ok(sets)
}

fn vtable(master: &MasterFunctionGenerator) -> Vtable {
    let append = master.clone();
    let arm = master.clone();
    let reset = master.clone();
    let abort = master.clone();
    let flush = master.clone();
    let levels = master.clone();
    let names = master.clone();
    let armed = master.clone();
    let enabled = master.clone();
    let counts = master.clone();
    let get_tag = master.clone();
    let set_tag = master.clone();
    let get_stops = master.clone();
    let set_stops = master.clone();

    Vtable::new(MASTER_FG_INTERFACE)
        .method(
            "AppendParameterSets",
            "aanaanaaiaayaayaayaaybb",
            "b",
            move |ctx, args| {
                let mut args = ArgReader::new(args);
                let datasets = zip_datasets(
                    args.next()?,
                    args.next()?,
                    args.next()?,
                    args.next()?,
                    args.next()?,
                    args.next()?,
                    args.next()?,
                )?;
                let arm: bool = args.next()?;
                let wait_for_arm_ack: bool = args.next()?;
                args.finish()?;

                let low_fill = append.append_parameter_sets(datasets, arm)?;
                if arm && wait_for_arm_ack {
                    let pending = ctx.defer();
                    append.wait_for_arm(Box::new(move |result| {
                        pending.complete(
                            result
                                .map(|()| vec![Value::Bool(low_fill)])
                                .map_err(CallError::from),
                        );
                    }));
                }
                Ok(vec![Value::Bool(low_fill)])
            },
        )
        .owner_only("Arm")
        .method("Arm", "", "", move |_, _| {
            arm.arm();
            Ok(Vec::new())
        })
        .method("Reset", "", "", move |_, _| {
            reset.reset()?;
            Ok(Vec::new())
        })
        .owner_only("Abort")
        .method("Abort", "", "", move |ctx, _| {
            let pending = ctx.defer();
            abort.abort(Box::new(move |result| {
                pending.complete(result.map(|()| Vec::new()).map_err(CallError::from));
            }));
            Ok(Vec::new())
        })
        .owner_only("Flush")
        .method("Flush", "", "", move |_, _| {
            flush.flush()?;
            Ok(Vec::new())
        })
        .method("ReadFillLevels", "", "at", move |_, _| {
            Ok(vec![seq(levels.read_fill_levels(), Value::UInt64)])
        })
        .method("ReadNames", "", "as", move |_, _| {
            Ok(vec![seq(names.read_names(), Value::Str)])
        })
        .method("ReadArmed", "", "ab", move |_, _| {
            Ok(vec![seq(armed.read_armed(), Value::Bool)])
        })
        .method("ReadEnabled", "", "ab", move |_, _| {
            Ok(vec![seq(enabled.read_enabled(), Value::Bool)])
        })
        .method("ReadExecutedParameterCounts", "", "au", move |_, _| {
            Ok(vec![seq(counts.read_executed_parameter_counts(), Value::UInt32)])
        })
        .owner_only("StartTag")
        .writable_property(
            "StartTag",
            "u",
            move || Ok(Value::UInt32(get_tag.start_tag())),
            move |_, value| {
                let tag = match value {
                    Value::UInt32(tag) => tag,
                    other => return Err(CallError::invalid_args(format!("expected u, got {other}"))),
                };
                set_tag.set_start_tag(tag)?;
                Ok(())
            },
        )
        .writable_property(
            "GenerateIndividualStopSignals",
            "b",
            move || Ok(Value::Bool(get_stops.generate_individual_stop_signals())),
            move |_, value| {
                let on = value
                    .as_bool()
                    .ok_or_else(|| CallError::invalid_args("expected b"))?;
                set_stops.set_generate_individual_stop_signals(on);
                Ok(())
            },
        )
        .signal("AllArmed", "")
        .signal("AllStopped", "t")
        .signal("Stopped", "stbbb")
        .signal("StartTag", "u")
}

fn seq<T>(items: Vec<T>, wrap: impl Fn(T) -> Value) -> Value {
    Value::Seq(items.into_iter().map(wrap).collect())
}
