use std::collections::BTreeMap;
use std::time::Duration;

use crate::control::{Buckets, StatsReport};

/// Counts of samples per whole microsecond.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    buckets: Buckets,
}

impl Histogram {
    /// Record one sample. Negative and non-finite values land in bucket 0.
    pub fn record_us(&mut self, micros: f64) {
        let bucket = if micros.is_finite() && micros > 0.0 {
            micros.floor() as u64
        } else {
            0
        };
        *self.buckets.entry(bucket).or_insert(0) += 1;
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.record_us(elapsed.as_nanos() as f64 / 1e3);
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn buckets(&self) -> &Buckets {
        &self.buckets
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Flight-time and dispatch-time statistics. Off by default.
#[derive(Debug, Default)]
pub struct Stats {
    enabled: bool,
    flight_times: Histogram,
    functions: BTreeMap<String, Histogram>,
}

impl Stats {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Switching on starts from empty histograms.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.flight_times.clear();
            self.functions.clear();
        }
        self.enabled = enabled;
    }

    pub fn record_flight_time(&mut self, micros: f64) {
        if self.enabled {
            self.flight_times.record_us(micros);
        }
    }

    /// Record how long `interface.method` took to dispatch.
    pub fn record_function(&mut self, interface: &str, method: &str, elapsed: Duration) {
        if self.enabled {
            self.functions
                .entry(format!("{interface}.{method}"))
                .or_default()
                .record(elapsed);
        }
    }

    pub fn flight_times(&self) -> &Histogram {
        &self.flight_times
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            enabled: self.enabled,
            flight_times: self.flight_times.buckets().clone(),
            function_times: self
                .functions
                .iter()
                .map(|(name, hist)| (name.clone(), hist.buckets().clone()))
                .collect(),
        }
    }
}
