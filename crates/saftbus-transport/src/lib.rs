//! Local transport for saftbus.
//!
//! Provides the pieces everything else is built on:
//! - [`UnixDomainSocket`] listeners bound to numbered slot paths
//! - [`IpcStream`], a connected socket that can carry file descriptors
//! - [`pipe`] for the unidirectional signal pipes handed to the server
//!
//! Only local UNIX-domain sockets are supported.

pub mod error;
pub mod pipe;
pub mod slot;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use pipe::{pipe, set_nonblocking};
pub use slot::{slot_path, SlotId, DEFAULT_SOCKET_BASE, MAX_SLOTS};
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
