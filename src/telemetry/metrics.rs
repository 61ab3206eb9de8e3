// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for lease and session monitoring.
//!
//! Provides lightweight counters and timings without external dependencies.
//! Non-fatal failures (missed heartbeats, stalled turns) are counted here so
//! they stay observable without being raised.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Named event counters.
    counters: RwLock<HashMap<String, u64>>,

    /// Timed operations by name.
    operations: RwLock<HashMap<String, OperationMetrics>>,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a named counter.
    pub fn record_event(&self, name: &str) {
        if let Ok(mut counters) = self.counters.write() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Record a timed operation.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        if let Ok(mut ops) = self.operations.write() {
            ops.entry(name.to_string())
                .or_insert_with(OperationMetrics::new)
                .record(duration);
        }
    }

    /// Current value of a counter (0 if never recorded).
    pub fn event_count(&self, name: &str) -> u64 {
        self.counters
            .read()
            .ok()
            .and_then(|c| c.get(name).copied())
            .unwrap_or(0)
    }

    /// Get metrics for a specific operation.
    pub fn operation_metrics(&self, name: &str) -> Option<OperationMetrics> {
        self.operations.read().ok()?.get(name).cloned()
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().map(|c| c.clone()).unwrap_or_default(),
            operations: self.operations.read().map(|o| o.clone()).unwrap_or_default(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        if let Ok(mut counters) = self.counters.write() {
            counters.clear();
        }
        if let Ok(mut ops) = self.operations.write() {
            ops.clear();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing statistics for one operation name.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
    }

    /// Average duration, zero when nothing was recorded.
    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub operations: HashMap<String, OperationMetrics>,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Render counters and timings as aligned text lines, sorted by name.
    pub fn format(&self) -> String {
        let mut lines = Vec::new();
        let mut counters: Vec<_> = self.counters.iter().collect();
        counters.sort();
        for (name, value) in counters {
            lines.push(format!("{:<32} {}", name, value));
        }
        let mut ops: Vec<_> = self.operations.iter().collect();
        ops.sort_by(|a, b| a.0.cmp(b.0));
        for (name, op) in ops {
            lines.push(format!(
                "{:<32} n={} avg={:?} max={:?}",
                name,
                op.count,
                op.avg_duration(),
                op.max_duration
            ));
        }
        lines.join("\n")
    }
}

/// Guard that records the elapsed time of an operation when finished.
pub struct TimedOperation {
    #[cfg_attr(not(feature = "telemetry"), allow(dead_code))]
    name: &'static str,
    start: Instant,
}

impl TimedOperation {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation(self.name, elapsed);
        elapsed
    }
}

/// Count an event on the global collector when telemetry is enabled.
#[inline]
pub fn count(name: &str) {
    #[cfg(feature = "telemetry")]
    GLOBAL_METRICS.record_event(name);
    #[cfg(not(feature = "telemetry"))]
    let _ = name;
}
