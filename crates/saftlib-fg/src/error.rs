use std::time::Duration;

use saftbus_core::{CallError, ErrorKind, SaftbusError};

/// Errors raised by the function-generator domain.
#[derive(Debug, thiserror::Error)]
pub enum FgError {
    /// A request was malformed or out of range.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The channel is in a state that does not allow the request.
    #[error("{0}")]
    Rejected(String),

    /// The hardware did not answer in time.
    #[error("hardware did not respond within {0:?}")]
    Timeout(Duration),

    /// The hardware backend reported a failure.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// A bus operation failed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// A proxy call failed.
    #[error(transparent)]
    Bus(#[from] SaftbusError),
}

impl FgError {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        FgError::InvalidArgs(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        FgError::Rejected(message.into())
    }
}

/// How a domain error is reported to a bus caller.
impl From<FgError> for CallError {
    fn from(err: FgError) -> Self {
        match err {
            FgError::InvalidArgs(message) => CallError::invalid_args(message),
            FgError::Rejected(message) => CallError::failed(message),
            FgError::Timeout(after) => {
                CallError::timeout(format!("hardware did not respond within {after:?}"))
            }
            FgError::Hardware(message) => CallError::io_error(message),
            FgError::Call(call) => call,
            FgError::Bus(bus) => match bus {
                SaftbusError::Call(call) => call,
                other => CallError::new(ErrorKind::Failed, other.to_string()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, FgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_bus_error_kinds() {
        let cases = [
            (FgError::invalid_args("x"), ErrorKind::InvalidArgs),
            (FgError::rejected("x"), ErrorKind::Failed),
            (FgError::Timeout(Duration::from_secs(1)), ErrorKind::Timeout),
            (FgError::Hardware("x".into()), ErrorKind::IoError),
            (
                FgError::Bus(SaftbusError::Call(CallError::permission_denied("x"))),
                ErrorKind::PermissionDenied,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(CallError::from(err).kind, kind);
        }
    }
}
