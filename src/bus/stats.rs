//! Message bus delivery statistics

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per message type counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
}

/// Snapshot of bus activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub sent_total: u64,
    pub received_total: u64,
    pub dropped_total: u64,
    /// Handler invocations that returned an error
    pub failed_total: u64,
    pub per_type: BTreeMap<String, TypeStats>,
    pub latency_samples: usize,
    pub latency_avg_us: f64,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub subscriptions: usize,
    pub pending: usize,
    pub uptime_ms: u64,
}

/// Mutable accumulator behind the bus stats lock
pub(crate) struct StatsCollector {
    started: Instant,
    sent_total: u64,
    received_total: u64,
    dropped_total: u64,
    failed_total: u64,
    per_type: BTreeMap<String, TypeStats>,
    latencies: VecDeque<u64>,
    max_samples: usize,
}

impl StatsCollector {
    pub(crate) fn new(max_samples: usize) -> Self {
        Self {
            started: Instant::now(),
            sent_total: 0,
            received_total: 0,
            dropped_total: 0,
            failed_total: 0,
            per_type: BTreeMap::new(),
            latencies: VecDeque::with_capacity(max_samples.min(4096)),
            max_samples: max_samples.max(1),
        }
    }

    pub(crate) fn record_sent(&mut self, message_type: &str) {
        self.sent_total += 1;
        self.per_type.entry(message_type.to_string()).or_default().sent += 1;
    }

    pub(crate) fn record_received(&mut self, message_type: &str, latency: Duration) {
        self.received_total += 1;
        self.per_type.entry(message_type.to_string()).or_default().received += 1;
        if self.latencies.len() == self.max_samples {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency.as_micros() as u64);
    }

    pub(crate) fn record_dropped(&mut self, message_type: &str) {
        self.dropped_total += 1;
        self.per_type.entry(message_type.to_string()).or_default().dropped += 1;
    }

    pub(crate) fn record_failed(&mut self) {
        self.failed_total += 1;
    }

    pub(crate) fn snapshot(&self, subscriptions: usize, pending: usize) -> BusStats {
        let samples = self.latencies.len();
        let (avg, min, max) = if samples == 0 {
            (0.0, 0, 0)
        } else {
            let sum: u64 = self.latencies.iter().sum();
            (
                sum as f64 / samples as f64,
                self.latencies.iter().copied().min().unwrap_or(0),
                self.latencies.iter().copied().max().unwrap_or(0),
            )
        };
        BusStats {
            sent_total: self.sent_total,
            received_total: self.received_total,
            dropped_total: self.dropped_total,
            failed_total: self.failed_total,
            per_type: self.per_type.clone(),
            latency_samples: samples,
            latency_avg_us: avg,
            latency_min_us: min,
            latency_max_us: max,
            subscriptions,
            pending,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn reset(&mut self) {
        let max_samples = self.max_samples;
        let started = self.started;
        *self = Self::new(max_samples);
        self.started = started;
    }
}
