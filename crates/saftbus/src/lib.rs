//! saftbus: a local object bus for the timing-receiver daemon.
//!
//! Clients reach objects registered in one daemon process over UNIX
//! socket slots; signals come back over per-proxy pipes or in-band on the
//! socket.
//!
//! # Crate Structure
//!
//! - [`transport`]: socket slots, descriptor passing, pipes
//! - [`serial`]: wire values, type signatures and the binary serializer
//! - [`frame`]: typed, length-prefixed frames
//! - [`core`]: event loop, registry, service, server and proxies
//! - [`fg`]: function-generator objects and the device directory (behind `fg`)

/// Re-export transport types.
pub mod transport {
    pub use saftbus_transport::*;
}

/// Re-export serializer types.
pub mod serial {
    pub use saftbus_serial::*;
}

/// Re-export frame types.
pub mod frame {
    pub use saftbus_frame::*;
}

/// Re-export the bus runtime.
pub mod core {
    pub use saftbus_core::*;
}

/// Re-export the function-generator domain (requires `fg` feature).
#[cfg(feature = "fg")]
pub mod fg {
    pub use saftlib_fg::*;
}

pub use saftbus_core::{ClientConfig, ClientContext, EventLoop, Proxy, Server, ServerConfig, Service};
