use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Histogram buckets: whole microseconds -> count.
pub type Buckets = BTreeMap<u64, u64>;

/// interface -> object path -> index.
pub type IndexTable = BTreeMap<String, BTreeMap<String, u32>>;

/// STATUS reply: the object table plus timing statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub indices: IndexTable,
    /// Indices of objects with at least one subscribed proxy.
    pub active_indices: BTreeSet<u32>,
    pub stats_enabled: bool,
    pub flight_times: Buckets,
    pub function_times: BTreeMap<String, Buckets>,
}

/// One registered signal route as shown by GET_STATE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipeEntry {
    pub proxy_id: u64,
    /// `pipe` or `inband`.
    pub route: String,
    /// Connection that registered the route.
    pub connection: String,
}

/// GET_STATE reply: every piece of mutable server state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateReport {
    pub indices: IndexTable,
    pub active_indices: BTreeSet<u32>,
    pub object_counter: u64,
    pub signal_counter: u64,
    pub sockets_active: Vec<bool>,
    /// slot -> peer pid.
    pub socket_owner: BTreeMap<usize, u32>,
    /// interface -> object path -> routes.
    pub proxy_pipes: BTreeMap<String, BTreeMap<String, Vec<PipeEntry>>>,
    pub connection_counter: u64,
    /// object path -> owning connection.
    pub owners: BTreeMap<String, String>,
    pub plugins: BTreeMap<String, bool>,
}

impl StateReport {
    /// Number of registered signal routes.
    pub fn pipe_count(&self) -> usize {
        self.proxy_pipes
            .values()
            .flat_map(|paths| paths.values())
            .map(Vec::len)
            .sum()
    }
}

/// GET_STATS reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub enabled: bool,
    pub flight_times: Buckets,
    /// `interface.method` -> run-time buckets.
    pub function_times: BTreeMap<String, Buckets>,
}

/// Privileged control request carried by REMOVE_OBJECT and LOAD_PLUGIN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivilegedRequest {
    pub target: String,
}
