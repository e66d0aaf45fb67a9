//! Boundary to the function-generator hardware.
//!
//! A channel drives its hardware through [`ChannelBackend`]. Completion of
//! hardware operations is never reported synchronously: the backend hands
//! [`Irq`] values to the [`IrqSink`] it was attached to, from the event loop.

use std::rc::Rc;

use crate::error::{FgError, Result};

/// One block of polynomial segments for a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    pub coeff_a: Vec<i16>,
    pub coeff_b: Vec<i16>,
    pub coeff_c: Vec<i32>,
    pub step: Vec<u8>,
    pub freq: Vec<u8>,
    pub shift_a: Vec<u8>,
    pub shift_b: Vec<u8>,
}

impl ParameterSet {
    /// Number of segments, after checking that every column has the same length.
    pub fn validate(&self) -> Result<usize> {
        let len = self.coeff_a.len();
        let lengths = [
            self.coeff_b.len(),
            self.coeff_c.len(),
            self.step.len(),
            self.freq.len(),
            self.shift_a.len(),
            self.shift_b.len(),
        ];
        if lengths.iter().any(|&l| l != len) {
            return Err(FgError::invalid_args("Mismatched parameter set lengths"));
        }
        Ok(len)
    }

    pub fn len(&self) -> usize {
        self.coeff_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeff_a.is_empty()
    }
}

/// Details of a channel stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopInfo {
    /// Hardware timestamp in nanoseconds.
    pub time: u64,
    pub abort: bool,
    pub hardware_underflow: bool,
    pub microcontroller_underflow: bool,
    /// Segments executed since the channel was armed.
    pub executed: u32,
}

/// Interrupts raised by a channel's hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Irq {
    /// The channel accepted the arm request and waits for its start tag.
    Armed,
    /// The start tag arrived; output began at `time`.
    Started { time: u64 },
    Stopped(StopInfo),
}

/// Where a backend reports its interrupts.
pub type IrqSink = Rc<dyn Fn(Irq)>;

/// Identity of a channel as decoded from its firmware macro word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroWord(pub u32);

impl MacroWord {
    pub fn scu_slot(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn device_number(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn version(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Channel name, `fg-<slot>-<device>`.
    pub fn channel_name(self) -> String {
        format!("fg-{}-{}", self.scu_slot(), self.device_number())
    }
}

/// Hardware operations of one function-generator channel.
pub trait ChannelBackend {
    /// Register the sink for this channel's interrupts.
    fn attach(&mut self, irq: IrqSink);

    /// Queue segments in the hardware buffer.
    fn load(&mut self, set: &ParameterSet) -> Result<()>;

    /// Drop every queued segment.
    fn flush(&mut self) -> Result<()>;

    /// Arm the channel to start on `start_tag`.
    fn arm(&mut self, start_tag: u32) -> Result<()>;

    /// Stop output and disable the channel. An enabled channel answers
    /// with an aborted [`Irq::Stopped`].
    fn reset(&mut self) -> Result<()>;
}
