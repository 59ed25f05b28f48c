//! Download counters fed by registry events

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::registry::DownloadEvent;

/// Metrics handle for recording download counters
#[derive(Debug, Default)]
pub struct Metrics {
    started: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    recovered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &DownloadEvent) {
        let (counter, name) = match event {
            DownloadEvent::Started { .. } => (&self.started, "started"),
            DownloadEvent::Finished { .. } => (&self.finished, "finished"),
            DownloadEvent::Failed { .. } => (&self.failed, "failed"),
            DownloadEvent::Cancelled { .. } => (&self.cancelled, "cancelled"),
            DownloadEvent::InterruptedTasksPopulated { downloads } => {
                self.recovered
                    .fetch_add(downloads.len() as u64, Ordering::Relaxed);
                tracing::debug!(counter = "recovered", by = downloads.len(), "Metric incremented");
                return;
            }
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = name, "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Downloads rebuilt from persisted transfers
    pub recovered: u64,
}
