//! Process-wide client state: the event loop and the lazily opened
//! connection every proxy shares.

use std::cell::RefCell;
use std::path::PathBuf;
use std::time::Duration;

use saftbus_frame::FrameConfig;
use saftbus_transport::DEFAULT_SOCKET_BASE;
use tracing::info;

use crate::call::SignalRoute;
use crate::connection::ProxyConnection;
use crate::error::Result;
use crate::event_loop::EventLoop;

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Slot paths are `<socket_base>NN`.
    pub socket_base: PathBuf,
    /// How long to wait for the daemon's HELLO on each slot.
    pub hello_timeout: Duration,
    /// Send each received signal's flight time back to the daemon.
    pub report_flight_time: bool,
    /// Route used by proxies created through this context.
    pub signal_route: SignalRoute,
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_base: PathBuf::from(DEFAULT_SOCKET_BASE),
            hello_timeout: Duration::from_secs(5),
            report_flight_time: false,
            signal_route: SignalRoute::Pipe,
            frame: FrameConfig::default(),
        }
    }
}

/// Explicit replacement for a process-global connection. Create one at
/// start-up and hand it to every proxy.
#[derive(Debug)]
pub struct ClientContext {
    config: ClientConfig,
    event_loop: EventLoop,
    connection: RefCell<Option<ProxyConnection>>,
}

impl ClientContext {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_event_loop(EventLoop::new(), config)
    }

    /// Share an existing loop, e.g. one that also drives a local service.
    pub fn with_event_loop(event_loop: EventLoop, config: ClientConfig) -> Self {
        Self {
            config,
            event_loop,
            connection: RefCell::new(None),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The shared connection, opened on first use. A connection that was
    /// lost is replaced by a fresh one.
    pub fn connection(&self) -> Result<ProxyConnection> {
        let mut slot = self.connection.borrow_mut();
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            info!(slot = %conn.slot(), "replacing lost connection");
        }
        let conn = ProxyConnection::connect(&self.event_loop, self.config.clone())?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// True while a live connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection
            .borrow()
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }
}
