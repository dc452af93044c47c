//! In-process relay counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters shared by every cycle.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pulls: AtomicU64,
    fetch_failures: AtomicU64,
    matches: AtomicU64,
    forward_successes: AtomicU64,
    forward_failures: AtomicU64,
    last_cycle_millis: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pull_count: u64,
    pub fetch_failures: u64,
    pub match_count: u64,
    pub forward_successes: u64,
    pub forward_failures: u64,
    pub last_cycle_millis: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pull(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_success(&self) {
        self.forward_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_duration(&self, duration: Duration) {
        self.last_cycle_millis
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pull_count: self.pulls.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            match_count: self.matches.load(Ordering::Relaxed),
            forward_successes: self.forward_successes.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            last_cycle_millis: self.last_cycle_millis.load(Ordering::Relaxed),
        }
    }
}
