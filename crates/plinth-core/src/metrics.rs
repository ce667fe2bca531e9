//! In-process metrics surface.
//!
//! Lifecycle hooks (queue behaviors, job runners) emit through a
//! [`MetricsClient`]; the in-memory client aggregates per-name totals so tests
//! and dashboards can read them back without an external collector.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Sink for counters, gauges and timers.
///
/// Metric names follow `{prefix}.{component}.{event}`, e.g.
/// `plinth.orders.completed` or `plinth.orders.processtime`.
pub trait MetricsClient: Send + Sync {
    /// Add `value` to a monotonic counter
    fn counter(&self, name: &str, value: u64);

    /// Set a gauge to `value`
    fn gauge(&self, name: &str, value: i64);

    /// Record one timed observation
    fn timer(&self, name: &str, duration: Duration);
}

/// Aggregated observations for a single timer name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_ms: u64,
}

impl TimerSnapshot {
    /// Mean duration in milliseconds, zero when empty
    pub fn avg_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ms / self.count
        }
    }
}

#[derive(Default)]
struct TimerCell {
    count: AtomicU64,
    total_ms: AtomicU64,
}

/// Metrics client that aggregates in process memory
#[derive(Default)]
pub struct InMemoryMetricsClient {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    timers: DashMap<String, TimerCell>,
}

impl InMemoryMetricsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never written
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of a gauge, zero if never written
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Aggregated observations for a timer
    pub fn timer_snapshot(&self, name: &str) -> TimerSnapshot {
        self.timers
            .get(name)
            .map(|t| TimerSnapshot {
                count: t.count.load(Ordering::Relaxed),
                total_ms: t.total_ms.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Names of all counters written so far
    pub fn counter_names(&self) -> Vec<String> {
        self.counters.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop all recorded values
    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.timers.clear();
    }
}

impl MetricsClient for InMemoryMetricsClient {
    fn counter(&self, name: &str, value: u64) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    fn gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    fn timer(&self, name: &str, duration: Duration) {
        let cell = self.timers.entry(name.to_string()).or_default();
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Metrics client that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsClient;

impl MetricsClient for NullMetricsClient {
    fn counter(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: i64) {}
    fn timer(&self, _name: &str, _duration: Duration) {}
}
