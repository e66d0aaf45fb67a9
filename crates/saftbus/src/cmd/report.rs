//! Read-only views of the daemon: STATUS and GET_STATE.

use crate::cmd::Globals;
use crate::exit::{bus_error, CliResult, SUCCESS};
use crate::output::{print_pipes, print_state, print_status};

pub fn status(globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let report = connection
        .status()
        .map_err(|err| bus_error("status failed", err))?;
    print_status(&report, globals.format);
    Ok(SUCCESS)
}

pub fn pipes(globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let report = connection
        .get_state()
        .map_err(|err| bus_error("get state failed", err))?;
    print_pipes(&report, globals.format);
    Ok(SUCCESS)
}

pub fn state(globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    let report = connection
        .get_state()
        .map_err(|err| bus_error("get state failed", err))?;
    print_state(&report, globals.format);
    Ok(SUCCESS)
}
