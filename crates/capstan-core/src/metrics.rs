//! Lock-free engine metrics.
//!
//! Atomic counters on the data path, point-in-time snapshots for readers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Task-queue metrics using atomics (no locks on the data path).
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Updates whose handler resolved before the deadline.
    pub completed: AtomicU64,
    /// Updates whose handler rejected before the deadline.
    pub handler_errors: AtomicU64,
    /// Updates purged because their handler outlived the deadline.
    pub timeouts: AtomicU64,
}

impl QueueMetrics {
    /// Records a handler that resolved in time.
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a handler rejection.
    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a task purged at its deadline.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`QueueMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct QueueMetricsSnapshot {
    /// Updates whose handler resolved before the deadline.
    pub completed: u64,
    /// Updates whose handler rejected before the deadline.
    pub handler_errors: u64,
    /// Updates purged at their deadline.
    pub timeouts: u64,
}

/// Per-source metrics using atomics.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    /// Total batches pulled from the supplier.
    pub batches: AtomicU64,
    /// Total updates across all batches.
    pub updates: AtomicU64,
    /// Fatal supply failures (retries exhausted or non-recoverable).
    pub supply_failures: AtomicU64,
    /// Last supply latency in nanoseconds.
    pub last_supply_ns: AtomicU64,
}

impl SourceMetrics {
    /// Records a successful supply call.
    pub fn record_supply(&self, updates: u64, latency_ns: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.updates.fetch_add(updates, Ordering::Relaxed);
        self.last_supply_ns.store(latency_ns, Ordering::Relaxed);
    }

    /// Records a fatal supply failure.
    pub fn record_failure(&self) {
        self.supply_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            supply_failures: self.supply_failures.load(Ordering::Relaxed),
            last_supply_ns: self.last_supply_ns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`SourceMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct SourceMetricsSnapshot {
    /// Total batches pulled.
    pub batches: u64,
    /// Total updates pulled.
    pub updates: u64,
    /// Fatal supply failures.
    pub supply_failures: u64,
    /// Last supply latency in nanoseconds.
    pub last_supply_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_metrics_snapshot() {
        let metrics = QueueMetrics::default();
        metrics.record_completion();
        metrics.record_completion();
        metrics.record_handler_error();
        metrics.record_timeout();

        let snap = metrics.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.handler_errors, 1);
        assert_eq!(snap.timeouts, 1);
    }

    #[test]
    fn test_source_metrics_snapshot() {
        let metrics = SourceMetrics::default();
        metrics.record_supply(7, 1_500);
        metrics.record_supply(3, 900);
        metrics.record_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.updates, 10);
        assert_eq!(snap.supply_failures, 1);
        assert_eq!(snap.last_supply_ns, 900);
    }
}
