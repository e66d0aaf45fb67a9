use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use saftbus_core::{Dispatch, EventLoop, Server, ServerConfig, Service};
use saftlib_fg::{Saftd, SimulatedDriver};
use tracing::info;

use crate::cmd::{DaemonArgs, Globals};
use crate::exit::{bus_error, fg_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};

/// How often the loop looks for a Ctrl-C.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

const SIMULATED_PLUGIN: &str = "simulated";
const SIMULATED_PLUGIN_DEVICE: &str = "sim";

pub fn run(args: DaemonArgs, globals: &Globals) -> CliResult<i32> {
    if args.slots == 0 || args.slots > saftbus_transport::MAX_SLOTS {
        return Err(CliError::new(
            USAGE,
            format!("--slots must be in 1..={}", saftbus_transport::MAX_SLOTS),
        ));
    }

    let service = Service::new(EventLoop::new());
    let saftd = Saftd::register(&service, SimulatedDriver::new(args.channels))
        .map_err(|err| CliError::new(INTERNAL, format!("device directory: {err}")))?;
    let device_path = saftd
        .attach_device(&args.device, "simulated")
        .map_err(|err| fg_error(&format!("attach {}", args.device), err))?;
    info!(device = %args.device, path = %device_path, channels = args.channels, "device attached");

    // LOAD_PLUGIN simulated attaches a second device on demand.
    let directory = saftd.clone();
    service.register_plugin(SIMULATED_PLUGIN, move |_service| {
        directory
            .attach_device(SIMULATED_PLUGIN_DEVICE, "simulated")
            .map(|_| ())
            .map_err(Into::into)
    });

    let interrupted = Arc::new(AtomicBool::new(false));
    install_ctrlc_handler(interrupted.clone())?;
    let weak = service.downgrade();
    service.event_loop().add_timeout(INTERRUPT_POLL, move || {
        if !interrupted.load(Ordering::SeqCst) {
            return Dispatch::Continue;
        }
        if let Some(service) = weak.upgrade() {
            info!("interrupted");
            service.request_quit();
        }
        Dispatch::Remove
    });

    let config = ServerConfig {
        socket_base: globals.socket_base.clone(),
        slots: args.slots,
        ..ServerConfig::default()
    };
    let server = Server::bind(service, config).map_err(|err| bus_error("bind failed", err))?;
    info!(base = %globals.socket_base.display(), slots = args.slots, "saftbus daemon ready");
    server.run().map_err(|err| bus_error("daemon failed", err))?;
    info!("daemon stopped");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(interrupted: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        interrupted.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
