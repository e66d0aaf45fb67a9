//! Function-generator hardware simulated on the event loop.
//!
//! Every interrupt a real channel would raise is delivered by a timer, so
//! the daemon and the tests run the full domain without hardware.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use saftbus_core::{Dispatch, EventLoop, Service, SourceId};
use tracing::debug;

use crate::backend::{ChannelBackend, Irq, IrqSink, MacroWord, ParameterSet, StopInfo};
use crate::error::{FgError, Result};
use crate::firmware::{self, FirmwareProbe, ScanConfig};
use crate::saftd::Driver;

/// Timing of a simulated channel.
#[derive(Debug, Clone)]
pub struct SimulatedTiming {
    /// Delay between an arm request and the `Armed` interrupt.
    pub arm_delay: Duration,
    /// Delay between `Armed` and `Started`; `None` waits for [`SimulatedChannel::start`].
    pub start_delay: Option<Duration>,
    /// Output time per segment.
    pub segment_time: Duration,
}

impl Default for SimulatedTiming {
    fn default() -> Self {
        Self {
            arm_delay: Duration::from_millis(1),
            start_delay: Some(Duration::from_millis(10)),
            segment_time: Duration::from_micros(100),
        }
    }
}

#[derive(Default)]
struct SimState {
    irq: Option<IrqSink>,
    loaded: u32,
    enabled: bool,
    running: bool,
    timer: Option<SourceId>,
}

/// A [`ChannelBackend`] whose interrupts come from event-loop timers.
#[derive(Clone)]
pub struct SimulatedChannel {
    event_loop: EventLoop,
    timing: SimulatedTiming,
    state: Rc<RefCell<SimState>>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl SimulatedChannel {
    pub fn new(event_loop: EventLoop, timing: SimulatedTiming) -> Self {
        Self {
            event_loop,
            timing,
            state: Rc::new(RefCell::new(SimState::default())),
        }
    }

    /// Segments loaded and not yet played out.
    pub fn loaded(&self) -> u32 {
        self.state.borrow().loaded
    }

    /// Deliver the start tag to an armed channel.
    pub fn start(&self) {
        let armed = {
            let state = self.state.borrow();
            state.enabled && !state.running
        };
        if armed {
            self.schedule(Duration::ZERO, Step::Start);
        }
    }

    fn schedule(&self, after: Duration, step: Step) {
        let this = self.clone();
        let timer = self.event_loop.add_timeout(after, move || {
            this.state.borrow_mut().timer = None;
            this.fire(step);
            Dispatch::Remove
        });
        if let Some(previous) = self.state.borrow_mut().timer.replace(timer) {
            self.event_loop.remove(previous);
        }
    }

    fn cancel(&self) {
        if let Some(timer) = self.state.borrow_mut().timer.take() {
            self.event_loop.remove(timer);
        }
    }

    fn fire(&self, step: Step) {
        let irq = {
            let mut state = self.state.borrow_mut();
            match step {
                Step::Armed => Irq::Armed,
                Step::Start => {
                    state.running = true;
                    Irq::Started { time: now_ns() }
                }
                Step::Stop { abort } => {
                    let executed = if abort { 0 } else { state.loaded };
                    state.loaded = 0;
                    state.enabled = false;
                    state.running = false;
                    Irq::Stopped(StopInfo {
                        time: now_ns(),
                        abort,
                        hardware_underflow: false,
                        microcontroller_underflow: false,
                        executed,
                    })
                }
            }
        };
        match step {
            Step::Armed => {
                if let Some(delay) = self.timing.start_delay {
                    self.schedule(delay, Step::Start);
                }
            }
            Step::Start => {
                let segments = self.state.borrow().loaded;
                self.schedule(self.timing.segment_time * segments, Step::Stop { abort: false });
            }
            Step::Stop { .. } => {}
        }
        let sink = self.state.borrow().irq.clone();
        if let Some(sink) = sink {
            sink(irq);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Armed,
    Start,
    Stop { abort: bool },
}

impl ChannelBackend for SimulatedChannel {
    fn attach(&mut self, irq: IrqSink) {
        self.state.borrow_mut().irq = Some(irq);
    }

    fn load(&mut self, set: &ParameterSet) -> Result<()> {
        let segments = u32::try_from(set.len())
            .map_err(|_| FgError::invalid_args("parameter set too large"))?;
        let mut state = self.state.borrow_mut();
        state.loaded = state.loaded.saturating_add(segments);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.state.borrow_mut().loaded = 0;
        Ok(())
    }

    fn arm(&mut self, start_tag: u32) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if state.enabled {
                return Err(FgError::Hardware("channel already enabled".into()));
            }
            state.enabled = true;
        }
        debug!(start_tag, "simulated arm");
        self.schedule(self.timing.arm_delay, Step::Armed);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let enabled = self.state.borrow().enabled;
        self.cancel();
        if enabled {
            self.schedule(Duration::ZERO, Step::Stop { abort: true });
        } else {
            self.state.borrow_mut().loaded = 0;
        }
        Ok(())
    }
}

/// A firmware instance with `channels` simulated channels in SCU slot 1.
pub struct SimulatedFirmware {
    event_loop: EventLoop,
    timing: SimulatedTiming,
    channels: usize,
    mailbox_slot: i64,
    scanned: bool,
    backends: Vec<SimulatedChannel>,
}

impl SimulatedFirmware {
    pub fn new(event_loop: EventLoop, channels: usize, timing: SimulatedTiming) -> Self {
        Self {
            event_loop,
            timing,
            channels,
            mailbox_slot: 0,
            scanned: false,
            backends: Vec::new(),
        }
    }

    pub fn with_mailbox_slot(mut self, slot: i64) -> Self {
        self.mailbox_slot = slot;
        self
    }

    /// Backends handed out so far, in channel order.
    pub fn backends(&self) -> &[SimulatedChannel] {
        &self.backends
    }
}

impl FirmwareProbe for SimulatedFirmware {
    fn mailbox_slot(&mut self) -> Result<i64> {
        Ok(self.mailbox_slot)
    }

    fn trigger_scan(&mut self, _mailbox_slot: u8) -> Result<()> {
        self.scanned = true;
        Ok(())
    }

    fn scan_complete(&mut self) -> Result<bool> {
        Ok(self.scanned)
    }

    fn macros(&mut self) -> Result<Vec<u32>> {
        // slot 1, device j, version 1
        Ok((0..self.channels)
            .map(|j| 0x0100_0100 | ((j as u32 & 0xff) << 16))
            .collect())
    }

    fn channel_backend(&mut self, _index: usize, _word: MacroWord) -> Result<Box<dyn ChannelBackend>> {
        let backend = SimulatedChannel::new(self.event_loop.clone(), self.timing.clone());
        self.backends.push(backend.clone());
        Ok(Box::new(backend))
    }
}

/// Attaches simulated firmware, whatever the device file.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    pub channels: usize,
    pub timing: SimulatedTiming,
    pub scan: ScanConfig,
}

impl SimulatedDriver {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            ..Self::default()
        }
    }
}

impl Driver for SimulatedDriver {
    fn attach(&self, service: &Service, device: &str, object_path: &str) -> Result<BTreeMap<String, String>> {
        debug!(device, path = object_path, channels = self.channels, "probing simulated firmware");
        let mut probe = SimulatedFirmware::new(service.event_loop().clone(), self.channels, self.timing.clone());
        let found = firmware::scan(service, object_path, &mut probe, &self.scan)?;
        let mut objects = found.paths;
        objects.insert("masterfg".to_string(), found.master_path);
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::channel::{ChannelEvent, EventKind, FunctionGenerator};

    fn pump(event_loop: &EventLoop, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            event_loop.iterate(Some(Duration::from_millis(10))).unwrap();
        }
        assert!(done(), "condition not reached");
    }

    fn set(len: usize) -> ParameterSet {
        ParameterSet {
            coeff_a: vec![1; len],
            coeff_b: vec![2; len],
            coeff_c: vec![3; len],
            step: vec![0; len],
            freq: vec![0; len],
            shift_a: vec![0; len],
            shift_b: vec![0; len],
        }
    }

    fn recorded(fg: &FunctionGenerator) -> Rc<RefCell<Vec<ChannelEvent>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for kind in [EventKind::Armed, EventKind::Running, EventKind::Stopped] {
            let log = log.clone();
            fg.subscribe(kind, move |event| log.borrow_mut().push(*event));
        }
        log
    }

    #[test]
    fn plays_out_loaded_segments() {
        let event_loop = EventLoop::new();
        let backend = SimulatedChannel::new(event_loop.clone(), SimulatedTiming::default());
        let fg = FunctionGenerator::new(MacroWord(0x0100_0100), Box::new(backend), 100);
        let log = recorded(&fg);

        fg.append_parameter_set(&set(4)).unwrap();
        fg.arm().unwrap();
        pump(&event_loop, || !fg.enabled());

        let log = log.borrow();
        assert!(matches!(log[0], ChannelEvent::Armed(true)));
        assert!(matches!(log[1], ChannelEvent::Armed(false)));
        assert!(matches!(log[2], ChannelEvent::Running(true)));
        match log.last() {
            Some(ChannelEvent::Stopped(info)) => {
                assert!(!info.abort);
                assert_eq!(info.executed, 4);
            }
            other => panic!("unexpected last event {other:?}"),
        }
        assert_eq!(fg.fill_level(), 0);
        assert_eq!(fg.executed_parameter_count(), 4);
    }

    #[test]
    fn reset_of_an_armed_channel_reports_an_abort() {
        let event_loop = EventLoop::new();
        let timing = SimulatedTiming {
            start_delay: None,
            ..SimulatedTiming::default()
        };
        let backend = SimulatedChannel::new(event_loop.clone(), timing);
        let fg = FunctionGenerator::new(MacroWord(0x0100_0000), Box::new(backend.clone()), 100);
        let log = recorded(&fg);

        fg.append_parameter_set(&set(2)).unwrap();
        fg.arm().unwrap();
        pump(&event_loop, || fg.armed());
        fg.reset().unwrap();
        pump(&event_loop, || !fg.enabled());

        match log.borrow().last() {
            Some(ChannelEvent::Stopped(info)) => assert!(info.abort),
            other => panic!("unexpected last event {other:?}"),
        }
        assert_eq!(backend.loaded(), 0);
        assert_eq!(event_loop.source_count(), 0);
    }

    #[test]
    fn driver_exports_channels_and_master() {
        let service = Service::new(EventLoop::new());
        let objects = SimulatedDriver::new(2)
            .attach(&service, "/dev/sim0", "/de/gsi/saftlib/sim")
            .unwrap();
        assert_eq!(objects["fg-1-0"], "/de/gsi/saftlib/sim/fg_0");
        assert_eq!(objects["fg-1-1"], "/de/gsi/saftlib/sim/fg_1");
        assert_eq!(objects["masterfg"], "/de/gsi/saftlib/sim/masterfg");
        assert_eq!(service.object_paths_under("/de/gsi/saftlib/sim").len(), 3);
    }
}
