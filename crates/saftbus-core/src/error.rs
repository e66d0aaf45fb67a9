use std::fmt;
use std::time::Duration;

use saftbus_serial::SerialError;

/// Category of an application error returned across the bus.
///
/// Codes are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Failed,
    InvalidArgs,
    IoError,
    NoSuchObject,
    NoSuchMethod,
    NoSuchProperty,
    PermissionDenied,
    DuplicateObject,
    DuplicateName,
    Timeout,
    DecodeError,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Failed => 0,
            ErrorKind::InvalidArgs => 1,
            ErrorKind::IoError => 2,
            ErrorKind::NoSuchObject => 3,
            ErrorKind::NoSuchMethod => 4,
            ErrorKind::NoSuchProperty => 5,
            ErrorKind::PermissionDenied => 6,
            ErrorKind::DuplicateObject => 7,
            ErrorKind::DuplicateName => 8,
            ErrorKind::Timeout => 9,
            ErrorKind::DecodeError => 10,
        }
    }

    /// Map a wire code back to a kind. Unknown codes read as `Failed`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ErrorKind::InvalidArgs,
            2 => ErrorKind::IoError,
            3 => ErrorKind::NoSuchObject,
            4 => ErrorKind::NoSuchMethod,
            5 => ErrorKind::NoSuchProperty,
            6 => ErrorKind::PermissionDenied,
            7 => ErrorKind::DuplicateObject,
            8 => ErrorKind::DuplicateName,
            9 => ErrorKind::Timeout,
            10 => ErrorKind::DecodeError,
            _ => ErrorKind::Failed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Failed => "Failed",
            ErrorKind::InvalidArgs => "InvalidArgs",
            ErrorKind::IoError => "IoError",
            ErrorKind::NoSuchObject => "NoSuchObject",
            ErrorKind::NoSuchMethod => "NoSuchMethod",
            ErrorKind::NoSuchProperty => "NoSuchProperty",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::DuplicateObject => "DuplicateObject",
            ErrorKind::DuplicateName => "DuplicateName",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::DecodeError => "DecodeError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An application error produced by a method handler or by dispatch.
///
/// The connection stays usable after a `CallError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

/// Bad argument values surface to the caller as `InvalidArgs`.
impl From<SerialError> for CallError {
    fn from(err: SerialError) -> Self {
        CallError::invalid_args(err.to_string())
    }
}

/// Errors that can occur in saftbus core operations.
#[derive(Debug, thiserror::Error)]
pub enum SaftbusError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] saftbus_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] saftbus_frame::FrameError),

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] SerialError),

    /// The remote side answered with an application error.
    #[error("call failed: {0}")]
    Call(#[from] CallError),

    /// The HELLO exchange failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer closed the connection at a frame boundary.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The connection went away while a reply was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer sent something that cannot be part of a valid exchange.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A blocking request was issued while another one on the same
    /// connection was still waiting, e.g. from an in-band signal handler.
    #[error("re-entrant call on a busy connection")]
    ReentrantCall,

    /// JSON serialization/deserialization error on a control report.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Plain I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SaftbusError {
    /// No connection slot could be obtained.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, SaftbusError::Transport(e) if e.is_resource_exhausted())
    }

    /// The connection must be dropped.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            SaftbusError::Frame(e) => e.is_protocol_violation(),
            SaftbusError::ProtocolViolation(_) => true,
            _ => false,
        }
    }

    /// The application error carried by this error, if any.
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            SaftbusError::Call(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SaftbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_roundtrip() {
        let kinds = [
            ErrorKind::Failed,
            ErrorKind::InvalidArgs,
            ErrorKind::IoError,
            ErrorKind::NoSuchObject,
            ErrorKind::NoSuchMethod,
            ErrorKind::NoSuchProperty,
            ErrorKind::PermissionDenied,
            ErrorKind::DuplicateObject,
            ErrorKind::DuplicateName,
            ErrorKind::Timeout,
            ErrorKind::DecodeError,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
        assert_eq!(ErrorKind::from_code(999), ErrorKind::Failed);
    }

    #[test]
    fn serial_errors_become_invalid_args() {
        let err: CallError = SerialError::MissingArgument(0).into();
        assert_eq!(err.kind, ErrorKind::InvalidArgs);
        assert_eq!(err.to_string(), "InvalidArgs: missing argument #0");
    }

    #[test]
    fn classification_helpers() {
        let busy = SaftbusError::Transport(saftbus_transport::TransportError::AllSlotsBusy {
            base: "/tmp/x_".into(),
            slots: 100,
        });
        assert!(busy.is_resource_exhausted());
        assert!(!busy.is_protocol_violation());

        let truncated = SaftbusError::Frame(saftbus_frame::FrameError::Truncated {
            expected: 18,
            received: 12,
        });
        assert!(truncated.is_protocol_violation());
    }
}
