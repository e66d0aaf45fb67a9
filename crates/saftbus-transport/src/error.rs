use std::path::PathBuf;

/// Errors that can occur in saftbus transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Every connection slot of the server is occupied (or no server exists).
    #[error("all sockets busy at {base} ({slots} slots tried)")]
    AllSlotsBusy { base: String, slots: usize },

    /// The requested slot number is outside the supported range.
    #[error("slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: usize, max: usize },
}

impl TransportError {
    /// Whether this error means no connection slot could be obtained.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, TransportError::AllSlotsBusy { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
