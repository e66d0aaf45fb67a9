use std::fmt;
use std::io;

use saftbus_core::{CallError, ErrorKind, SaftbusError};
use saftbus_frame::FrameError;
use saftbus_serial::SerialError;
use saftbus_transport::TransportError;
use saftlib_fg::FgError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

/// Exit code for an application error returned by the daemon.
pub fn call_code(err: &CallError) -> i32 {
    match err.kind {
        ErrorKind::PermissionDenied => PERMISSION_DENIED,
        ErrorKind::InvalidArgs | ErrorKind::DecodeError => DATA_INVALID,
        ErrorKind::Timeout => TIMEOUT,
        _ => FAILURE,
    }
}

pub fn bus_error(context: &str, err: SaftbusError) -> CliError {
    match err {
        SaftbusError::Transport(err) => transport_error(context, err),
        SaftbusError::Frame(err) => frame_error(context, err),
        SaftbusError::Io(err) => io_error(context, err),
        SaftbusError::Call(err) => CliError::new(call_code(&err), format!("{context}: {err}")),
        SaftbusError::Decode(_) | SaftbusError::Json(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SaftbusError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SaftbusError::HandshakeFailed(_)
        | SaftbusError::Disconnected(_)
        | SaftbusError::ConnectionLost
        | SaftbusError::ProtocolViolation(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        SaftbusError::ReentrantCall => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

pub fn fg_error(context: &str, err: FgError) -> CliError {
    match err {
        FgError::Bus(err) => bus_error(context, err),
        FgError::InvalidArgs(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FgError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FgError::Call(ref call) => CliError::new(call_code(call), format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

/// A signature or literal given on the command line did not parse.
pub fn usage_error(context: &str, err: SerialError) -> CliError {
    CliError::new(USAGE, format!("{context}: {err}"))
}
