//! Function-generator objects on the saftbus object bus.
//!
//! A firmware scan turns each hardware channel into a [`FunctionGenerator`]
//! and groups them under one [`MasterFunctionGenerator`]. Devices are
//! attached through the [`Saftd`] directory. [`simulated`] provides
//! timer-driven hardware for the daemon and tests; [`proxies`] holds the
//! typed client side.

pub mod backend;
pub mod channel;
pub mod error;
mod events;
pub mod firmware;
pub mod master;
pub mod proxies;
pub mod saftd;
pub mod simulated;

pub use backend::{ChannelBackend, Irq, IrqSink, MacroWord, ParameterSet, StopInfo};
pub use channel::{ChannelEvent, EventKind, FunctionGenerator, DEFAULT_LOW_WATER_MARK, FG_INTERFACE};
pub use error::{FgError, Result};
pub use firmware::{scan, Firmware, FirmwareProbe, ScanConfig};
pub use master::{
    zip_datasets, ArmState, MasterEvent, MasterEventKind, MasterFunctionGenerator, Waiter,
    DEFAULT_ARM_TIMEOUT, MASTER_FG_INTERFACE,
};
pub use proxies::{FunctionGeneratorProxy, MasterFunctionGeneratorProxy, SaftdProxy, StopEvent};
pub use saftd::{Driver, Saftd, SAFTD_INTERFACE, SAFTD_PATH};
pub use simulated::{SimulatedChannel, SimulatedDriver, SimulatedFirmware, SimulatedTiming};
