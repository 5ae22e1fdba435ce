//! Process metrics fed from the event bus

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A process lifecycle fact worth counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMetric {
    Started,
    Completed,
    Canceled,
    Terminated,
    Incident,
    Recovered,
}

/// Destination for process metrics
///
/// Recording happens on the event delivery path and must not block.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: ProcessMetric);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _metric: ProcessMetric) {}
}

/// Counters kept in memory
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    canceled: AtomicU64,
    terminated: AtomicU64,
    incidents: AtomicU64,
    recovered: AtomicU64,

    /// Processes started and not yet ended
    active: AtomicI64,
}

/// Point-in-time copy of [`InMemoryMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub canceled: u64,
    pub terminated: u64,
    pub incidents: u64,
    pub recovered: u64,
    pub active: i64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, metric: ProcessMetric) {
        let (counter, active_delta) = match metric {
            ProcessMetric::Started => (&self.started, 1),
            ProcessMetric::Completed => (&self.completed, -1),
            ProcessMetric::Canceled => (&self.canceled, -1),
            ProcessMetric::Terminated => (&self.terminated, -1),
            ProcessMetric::Incident => (&self.incidents, 0),
            ProcessMetric::Recovered => (&self.recovered, 0),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if active_delta != 0 {
            self.active.fetch_add(active_delta, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_gauge() {
        let metrics = InMemoryMetrics::new();
        metrics.record(ProcessMetric::Started);
        metrics.record(ProcessMetric::Started);
        metrics.record(ProcessMetric::Incident);
        metrics.record(ProcessMetric::Canceled);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.incidents, 1);
        assert_eq!(snapshot.canceled, 1);
        assert_eq!(snapshot.active, 1);
    }
}
