//! Object bus runtime: registry, signal delivery, daemon and proxies.
//!
//! The daemon side is a [`Service`] (objects, owners, signal routes,
//! statistics) served by a [`Server`] on a fixed set of socket slots.
//! The client side is a [`ClientContext`] holding the process's one
//! [`ProxyConnection`], shared by every [`Proxy`]. Both run on a
//! single-threaded [`EventLoop`].

pub mod call;
pub mod connection;
pub mod connector;
pub mod context;
pub mod control;
pub mod error;
pub mod event_loop;
pub mod handshake;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod service;
pub mod signal;
pub mod stats;

pub use call::{
    CallResult, MethodCall, PropertiesChanged, SignalMessage, SignalRoute,
    INTROSPECTABLE_INTERFACE, OWNED_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE,
};
pub use connection::ProxyConnection;
pub use connector::{connect_slot, SlotConnection};
pub use context::{ClientConfig, ClientContext};
pub use control::{PipeEntry, StateReport, StatsReport, StatusReport};
pub use error::{CallError, ErrorKind, Result, SaftbusError};
pub use event_loop::{Dispatch, EventLoop, Priority, Readiness, SourceId};
pub use handshake::{HandshakeConfig, Hello, PROTOCOL_VERSION};
pub use listener::SlotListeners;
pub use proxy::Proxy;
pub use registry::{ObjectSpec, Registry, Vtable};
pub use server::{Server, ServerConfig};
pub use service::{CallContext, ConnectionId, LocalReply, PendingReply, Service, WeakService};
pub use signal::SignalBus;
pub use stats::{Histogram, Stats};
