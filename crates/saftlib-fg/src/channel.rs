//! One function-generator channel and its bus object.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use saftbus_core::{CallError, ObjectSpec, Service, Vtable};
use saftbus_serial::{ArgReader, Value};
use tracing::{debug, warn};

use crate::backend::{ChannelBackend, Irq, MacroWord, ParameterSet, StopInfo};
use crate::error::{FgError, Result};
use crate::events::Subscribers;

pub const FG_INTERFACE: &str = "de.gsi.saftlib.FunctionGenerator";

/// Fill level below which `AppendParameterSet` asks for more data.
pub const DEFAULT_LOW_WATER_MARK: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Armed,
    Enabled,
    Running,
    Started,
    Stopped,
}

/// Notifications of a channel's state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Armed(bool),
    Enabled(bool),
    Running(bool),
    Started(u64),
    Stopped(StopInfo),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Armed(_) => EventKind::Armed,
            ChannelEvent::Enabled(_) => EventKind::Enabled,
            ChannelEvent::Running(_) => EventKind::Running,
            ChannelEvent::Started(_) => EventKind::Started,
            ChannelEvent::Stopped(_) => EventKind::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    fill_level: u64,
    armed: bool,
    enabled: bool,
    running: bool,
    start_tag: u32,
    executed: u32,
}

struct ChannelInner {
    name: String,
    macro_word: MacroWord,
    low_water_mark: u64,
    state: RefCell<ChannelState>,
    backend: RefCell<Box<dyn ChannelBackend>>,
    subscribers: Subscribers<EventKind, ChannelEvent>,
}

/// Handle to one channel. Clones share the channel.
#[derive(Clone)]
pub struct FunctionGenerator {
    inner: Rc<ChannelInner>,
}

impl std::fmt::Debug for FunctionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionGenerator")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state.borrow())
            .finish()
    }
}

impl FunctionGenerator {
    pub fn new(macro_word: MacroWord, backend: Box<dyn ChannelBackend>, low_water_mark: u64) -> Self {
        let inner = Rc::new(ChannelInner {
            name: macro_word.channel_name(),
            macro_word,
            low_water_mark,
            state: RefCell::new(ChannelState::default()),
            backend: RefCell::new(backend),
            subscribers: Subscribers::default(),
        });
        let weak = Rc::downgrade(&inner);
        inner.backend.borrow_mut().attach(Rc::new(move |irq| {
            if let Some(inner) = weak.upgrade() {
                FunctionGenerator { inner }.handle_irq(irq);
            }
        }));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn macro_word(&self) -> MacroWord {
        self.inner.macro_word
    }

    pub fn fill_level(&self) -> u64 {
        self.inner.state.borrow().fill_level
    }

    pub fn armed(&self) -> bool {
        self.inner.state.borrow().armed
    }

    pub fn enabled(&self) -> bool {
        self.inner.state.borrow().enabled
    }

    pub fn running(&self) -> bool {
        self.inner.state.borrow().running
    }

    pub fn start_tag(&self) -> u32 {
        self.inner.state.borrow().start_tag
    }

    pub fn executed_parameter_count(&self) -> u32 {
        self.inner.state.borrow().executed
    }

    /// Armed, or has nothing to play.
    pub fn armed_or_idle(&self) -> bool {
        let state = self.inner.state.borrow();
        state.armed || state.fill_level == 0
    }

    /// Subscribe to one kind of event.
    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&ChannelEvent) + 'static) {
        self.inner.subscribers.subscribe(kind, Rc::new(handler));
    }

    fn emit(&self, event: ChannelEvent) {
        self.inner.subscribers.emit(&event.kind(), &event);
    }

    /// Queue a parameter set. Returns true while the fill level is below
    /// the low-water mark.
    pub fn append_parameter_set(&self, set: &ParameterSet) -> Result<bool> {
        let count = set.validate()? as u64;
        self.inner.backend.borrow_mut().load(set)?;
        let mut state = self.inner.state.borrow_mut();
        state.fill_level += count;
        Ok(state.fill_level < self.inner.low_water_mark)
    }

    pub fn flush(&self) -> Result<()> {
        if self.enabled() {
            return Err(FgError::rejected("Enabled, cannot Flush"));
        }
        self.inner.backend.borrow_mut().flush()?;
        self.inner.state.borrow_mut().fill_level = 0;
        Ok(())
    }

    pub fn arm(&self) -> Result<()> {
        {
            let state = self.inner.state.borrow();
            if state.enabled {
                return Err(FgError::rejected("Enabled, cannot arm"));
            }
            if state.fill_level == 0 {
                return Err(FgError::rejected("No data, cannot arm"));
            }
        }
        let start_tag = self.start_tag();
        self.inner.backend.borrow_mut().arm(start_tag)?;
        self.inner.state.borrow_mut().enabled = true;
        debug!(channel = %self.inner.name, start_tag, "arm requested");
        self.emit(ChannelEvent::Enabled(true));
        Ok(())
    }

    /// Stop the channel and discard queued data. An enabled channel is
    /// disabled once the hardware confirms the abort.
    pub fn reset(&self) -> Result<()> {
        self.inner.backend.borrow_mut().reset()?;
        self.inner.state.borrow_mut().fill_level = 0;
        Ok(())
    }

    /// Set the tag the next arm waits for. Refused while enabled.
    pub fn set_start_tag(&self, tag: u32) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.enabled {
            return Err(FgError::invalid_args("FG Enabled, cannot set StartTag"));
        }
        state.start_tag = tag;
        Ok(())
    }

    fn handle_irq(&self, irq: Irq) {
        debug!(channel = %self.inner.name, ?irq, "irq");
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();
            match irq {
                Irq::Armed => {
                    if !state.enabled {
                        warn!(channel = %self.inner.name, "armed irq on a disabled channel ignored");
                        return;
                    }
                    if !state.armed {
                        state.armed = true;
                        events.push(ChannelEvent::Armed(true));
                    }
                }
                Irq::Started { time } => {
                    if state.armed {
                        state.armed = false;
                        events.push(ChannelEvent::Armed(false));
                    }
                    state.running = true;
                    events.push(ChannelEvent::Running(true));
                    events.push(ChannelEvent::Started(time));
                }
                Irq::Stopped(info) => {
                    state.executed = info.executed;
                    state.fill_level = if info.abort {
                        0
                    } else {
                        state.fill_level.saturating_sub(u64::from(info.executed))
                    };
                    if state.armed {
                        state.armed = false;
                        events.push(ChannelEvent::Armed(false));
                    }
                    if state.running {
                        state.running = false;
                        events.push(ChannelEvent::Running(false));
                    }
                    if state.enabled {
                        state.enabled = false;
                        events.push(ChannelEvent::Enabled(false));
                    }
                    events.push(ChannelEvent::Stopped(info));
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Export the channel at `path`. Its events become bus signals and
    /// property changes; losing the owner resets the channel.
    pub fn register(&self, service: &Service, path: &str) -> std::result::Result<u32, CallError> {
        let weak = service.downgrade();
        let signal_path = path.to_string();
        let kinds = [
            EventKind::Armed,
            EventKind::Enabled,
            EventKind::Running,
            EventKind::Started,
            EventKind::Stopped,
        ];
        for kind in kinds {
            let weak = weak.clone();
            let path = signal_path.clone();
            let fg = Rc::downgrade(&self.inner);
            self.subscribe(kind, move |event| {
                let (Some(service), Some(inner)) = (weak.upgrade(), fg.upgrade()) else {
                    return;
                };
                publish(&service, &path, &FunctionGenerator { inner }, event);
            });
        }

        let fg = self.clone();
        let reset_on_quit = self.clone();
        let spec = ObjectSpec::new(path)
            .interface(vtable(&fg))
            .ownable()
            .on_owner_quit(move |_| {
                if let Err(err) = reset_on_quit.reset() {
                    warn!(channel = %reset_on_quit.name(), error = %err, "reset after owner quit failed");
                }
            });
        service.register(spec)
    }
}

fn publish(service: &Service, path: &str, fg: &FunctionGenerator, event: &ChannelEvent) {
    let mut changed = BTreeMap::new();
    match *event {
        ChannelEvent::Armed(armed) => {
            service.emit_signal(path, FG_INTERFACE, "Armed", vec![Value::Bool(armed)]);
            changed.insert("Armed".to_string(), Value::Bool(armed));
        }
        ChannelEvent::Enabled(enabled) => {
            service.emit_signal(path, FG_INTERFACE, "Enabled", vec![Value::Bool(enabled)]);
            changed.insert("Enabled".to_string(), Value::Bool(enabled));
        }
        ChannelEvent::Running(running) => {
            service.emit_signal(path, FG_INTERFACE, "Running", vec![Value::Bool(running)]);
            changed.insert("Running".to_string(), Value::Bool(running));
        }
        ChannelEvent::Started(time) => {
            service.emit_signal(path, FG_INTERFACE, "Started", vec![Value::UInt64(time)]);
        }
        ChannelEvent::Stopped(info) => {
            service.emit_signal(
                path,
                FG_INTERFACE,
                "Stopped",
                vec![
                    Value::UInt64(info.time),
                    Value::Bool(info.abort),
                    Value::Bool(info.hardware_underflow),
                    Value::Bool(info.microcontroller_underflow),
                ],
            );
            changed.insert("FillLevel".to_string(), Value::UInt64(fg.fill_level()));
            changed.insert(
                "ExecutedParameterCount".to_string(),
                Value::UInt32(fg.executed_parameter_count()),
            );
        }
    }
    if !changed.is_empty() {
        service.properties_changed(path, FG_INTERFACE, changed);
    }
}

fn vtable(fg: &FunctionGenerator) -> Vtable {
    let append = fg.clone();
    let flush = fg.clone();
    let arm = fg.clone();
    let reset = fg.clone();
    let (armed, enabled, running, fill, tag, executed, name) = (
        fg.clone(),
        fg.clone(),
        fg.clone(),
        fg.clone(),
        fg.clone(),
        fg.clone(),
        fg.name().to_string(),
    );
    Vtable::new(FG_INTERFACE)
        .method("AppendParameterSet", "ananaiayayayay", "b", move |_, args| {
            let mut args = ArgReader::new(args);
            let set = ParameterSet {
                coeff_a: args.next()?,
                coeff_b: args.next()?,
                coeff_c: args.next()?,
                step: args.next()?,
                freq: args.next()?,
                shift_a: args.next()?,
                shift_b: args.next()?,
            };
            args.finish()?;
            Ok(vec![Value::Bool(append.append_parameter_set(&set)?)])
        })
        .owner_only("Flush")
        .method("Flush", "", "", move |_, _| {
            flush.flush()?;
            Ok(Vec::new())
        })
        .owner_only("Arm")
        .method("Arm", "", "", move |_, _| {
            arm.arm()?;
            Ok(Vec::new())
        })
        .method("Reset", "", "", move |_, _| {
            reset.reset()?;
            Ok(Vec::new())
        })
        .property("Armed", "b", move || Ok(Value::Bool(armed.armed())))
        .property("Enabled", "b", move || Ok(Value::Bool(enabled.enabled())))
        .property("Running", "b", move || Ok(Value::Bool(running.running())))
        .property("FillLevel", "t", move || Ok(Value::UInt64(fill.fill_level())))
        .property("StartTag", "u", move || Ok(Value::UInt32(tag.start_tag())))
        .property("ExecutedParameterCount", "u", move || {
            Ok(Value::UInt32(executed.executed_parameter_count()))
        })
        .property("Name", "s", move || Ok(Value::Str(name.clone())))
        .signal("Armed", "b")
        .signal("Enabled", "b")
        .signal("Running", "b")
        .signal("Started", "t")
        .signal("Stopped", "tbbb")
}
