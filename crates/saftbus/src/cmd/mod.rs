use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use saftbus_core::{ClientConfig, ClientContext, ProxyConnection};

use crate::exit::{bus_error, CliResult};
use crate::output::OutputFormat;

pub mod control;
pub mod daemon;
pub mod object;
pub mod report;
pub mod version;

/// Options every subcommand sees.
#[derive(Debug, Clone)]
pub struct Globals {
    pub format: OutputFormat,
    pub socket_base: PathBuf,
}

impl Globals {
    /// Open the control connection to the daemon.
    pub fn connect(&self) -> CliResult<(ClientContext, ProxyConnection)> {
        let context = ClientContext::new(ClientConfig {
            socket_base: self.socket_base.clone(),
            hello_timeout: Duration::from_secs(5),
            ..ClientConfig::default()
        });
        let connection = context
            .connection()
            .map_err(|err| bus_error("connect failed", err))?;
        Ok((context, connection))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon with the device directory and a simulated device.
    Daemon(DaemonArgs),
    /// List registered objects and their indices.
    Status,
    /// List proxy signal routes.
    Pipes,
    /// Dump the daemon's mutable state.
    State,
    /// Print the introspection description of an object.
    Introspect(TargetArgs),
    /// Read one property.
    Get(GetArgs),
    /// Read every property of an interface.
    GetAll(TargetArgs),
    /// Write one property.
    Set(SetArgs),
    /// Call a method. Arguments are given as <SIG> <LITERAL> pairs.
    Call(CallArgs),
    /// Switch the daemon's per-call trace log.
    Logging(LoggingArgs),
    /// Timing statistics.
    Stats(StatsArgs),
    /// Remove an object (privileged).
    RemoveObject(RemoveObjectArgs),
    /// Load a plugin the daemon has registered (privileged).
    LoadPlugin(LoadPluginArgs),
    /// Stop the daemon (privileged).
    Quit,
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, globals: &Globals) -> CliResult<i32> {
    match command {
        Command::Daemon(args) => daemon::run(args, globals),
        Command::Status => report::status(globals),
        Command::Pipes => report::pipes(globals),
        Command::State => report::state(globals),
        Command::Introspect(args) => object::introspect(args, globals),
        Command::Get(args) => object::get(args, globals),
        Command::GetAll(args) => object::get_all(args, globals),
        Command::Set(args) => object::set(args, globals),
        Command::Call(args) => object::call(args, globals),
        Command::Logging(args) => control::logging(args, globals),
        Command::Stats(args) => control::stats(args, globals),
        Command::RemoveObject(args) => control::remove_object(args, globals),
        Command::LoadPlugin(args) => control::load_plugin(args, globals),
        Command::Quit => control::quit(globals),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Name of the simulated device to attach at startup.
    #[arg(long, default_value = "tr0")]
    pub device: String,
    /// Function-generator channels of the simulated device.
    #[arg(long, default_value = "4")]
    pub channels: usize,
    /// Number of socket slots to listen on.
    #[arg(long, default_value_t = saftbus_transport::MAX_SLOTS)]
    pub slots: usize,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    pub interface: String,
    pub path: String,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    pub interface: String,
    pub path: String,
    pub property: String,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    pub interface: String,
    pub path: String,
    pub property: String,
    /// Type signature of the value, e.g. `u` or `as`.
    pub signature: String,
    pub literal: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    pub interface: String,
    pub path: String,
    pub method: String,
    /// Alternating signatures and literals.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

#[derive(Args, Debug)]
pub struct LoggingArgs {
    pub state: Switch,
}

#[derive(Subcommand, Debug)]
pub enum StatsAction {
    /// Start collecting timing histograms.
    Enable,
    /// Stop collecting.
    Disable,
    /// Fetch the histograms as JSON.
    Download {
        /// Write to FILE instead of stdout.
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Also write `bucket count` tables into DIR: `saftbus_timing.dat`
        /// for flight times and one `<interface.method>.dat` per function.
        #[arg(long, value_name = "DIR")]
        dat: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(subcommand)]
    pub action: StatsAction,
}

#[derive(Args, Debug)]
pub struct RemoveObjectArgs {
    pub path: String,
}

#[derive(Args, Debug)]
pub struct LoadPluginArgs {
    pub name: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
