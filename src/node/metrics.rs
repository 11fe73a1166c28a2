//! Request counters for the node client.

use super::circuit_breaker::CircuitState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct NodeMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    refused: AtomicU64,
    latency_ns: AtomicU64,
}

impl NodeMetrics {
    pub(crate) fn record_success(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    fn add_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, breaker_state: CircuitState) -> NodeMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let latency_ns = self.latency_ns.load(Ordering::Relaxed);
        let average_latency_ms = if requests == 0 {
            0.0
        } else {
            latency_ns as f64 / requests as f64 / 1_000_000.0
        };

        NodeMetricsSnapshot {
            requests,
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            average_latency_ms,
            breaker_state,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct NodeMetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub refused: u64,
    pub average_latency_ms: f64,
    pub breaker_state: CircuitState,
}
