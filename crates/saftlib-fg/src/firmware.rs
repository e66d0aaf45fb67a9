//! Discovery of the function-generator channels behind a firmware instance.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use saftbus_core::Service;
use tracing::{debug, info, warn};

use crate::backend::{ChannelBackend, MacroWord};
use crate::channel::{FunctionGenerator, DEFAULT_LOW_WATER_MARK};
use crate::error::{FgError, Result};
use crate::master::{MasterFunctionGenerator, DEFAULT_ARM_TIMEOUT};

/// Highest mailbox slot the firmware can hand out.
pub const MAX_MAILBOX_SLOT: i64 = 127;

/// Access to a firmware instance before any channel exists.
pub trait FirmwareProbe {
    /// Mailbox slot reserved for scan requests; negative when none is free.
    fn mailbox_slot(&mut self) -> Result<i64>;

    /// Ask the firmware to scan its bus, answering through `mailbox_slot`.
    fn trigger_scan(&mut self, mailbox_slot: u8) -> Result<()>;

    fn scan_complete(&mut self) -> Result<bool>;

    /// Macro word per channel position; zero marks an empty position.
    fn macros(&mut self) -> Result<Vec<u32>>;

    /// Backend driving the channel at `index`.
    fn channel_backend(&mut self, index: usize, macro_word: MacroWord) -> Result<Box<dyn ChannelBackend>>;
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub scan_timeout: Duration,
    pub poll_interval: Duration,
    pub arm_timeout: Duration,
    pub low_water_mark: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            arm_timeout: DEFAULT_ARM_TIMEOUT,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
        }
    }
}

/// Channels found by a scan, already exported on the bus.
#[derive(Debug, Clone)]
pub struct Firmware {
    pub channels: Vec<FunctionGenerator>,
    pub master: MasterFunctionGenerator,
    /// Channel name to object path.
    pub paths: BTreeMap<String, String>,
    pub master_path: String,
}

/// Scan the firmware behind `probe` and export its channels under `path`.
pub fn scan(
    service: &Service,
    path: &str,
    probe: &mut dyn FirmwareProbe,
    config: &ScanConfig,
) -> Result<Firmware> {
    let mailbox = probe.mailbox_slot()?;
    if !(0..=MAX_MAILBOX_SLOT).contains(&mailbox) {
        return Err(FgError::invalid_args(format!(
            "mailbox slot {mailbox} out of range 0..={MAX_MAILBOX_SLOT}"
        )));
    }
    probe.trigger_scan(mailbox as u8)?;

    let deadline = Instant::now() + config.scan_timeout;
    while !probe.scan_complete()? {
        if Instant::now() >= deadline {
            return Err(FgError::Timeout(config.scan_timeout));
        }
        thread::sleep(config.poll_interval);
    }

    let mut exported = Vec::new();
    match export(service, path, probe, config, &mut exported) {
        Ok(firmware) => Ok(firmware),
        Err(err) => {
            for object in exported.iter().rev() {
                if let Err(remove_err) = service.remove_object(object) {
                    warn!(path = %object, error = %remove_err, "rollback of partial scan failed");
                }
            }
            warn!(%path, removed = exported.len(), error = %err, "scan aborted");
            Err(err)
        }
    }
}

/// Register every channel and the master, recording each exported path.
fn export(
    service: &Service,
    path: &str,
    probe: &mut dyn FirmwareProbe,
    config: &ScanConfig,
    exported: &mut Vec<String>,
) -> Result<Firmware> {
    let mut channels = Vec::new();
    let mut paths = BTreeMap::new();
    for (index, word) in probe.macros()?.into_iter().enumerate() {
        if word == 0 {
            continue;
        }
        let macro_word = MacroWord(word);
        let backend = probe.channel_backend(index, macro_word)?;
        let channel = FunctionGenerator::new(macro_word, backend, config.low_water_mark);
        let channel_path = format!("{path}/fg_{index}");
        channel.register(service, &channel_path)?;
        exported.push(channel_path.clone());
        debug!(path = %channel_path, name = %channel.name(), "channel exported");
        paths.insert(channel.name().to_string(), channel_path);
        channels.push(channel);
    }

    let master = MasterFunctionGenerator::new(channels.clone(), service.event_loop().clone(), config.arm_timeout);
    let master_path = format!("{path}/masterfg");
    master.register(service, &master_path)?;
    exported.push(master_path.clone());
    info!(path = %path, channels = channels.len(), "firmware scanned");

    Ok(Firmware {
        channels,
        master,
        paths,
        master_path,
    })
}
