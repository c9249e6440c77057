use crate::JobStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::*;

/// Destination for pipeline counters and gauges. Injected into the pool and workers.
pub trait MetricsSink: Send + Sync {
    /// A job reached a terminal status for this delivery.
    fn job_finished(&self, status: JobStatus);

    /// Number of versions a successful fetch produced for `product_id`.
    fn product_versions(&self, product_id: &str, count: usize);

    fn queue_gauges(&self, depth: u64, processing: u64);
}

/// Counts in process and reports every change as a `tracing` event.
#[derive(Debug, Default)]
pub struct LogMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl MetricsSink for LogMetrics {
    fn job_finished(&self, status: JobStatus) {
        let total = match status {
            JobStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed) + 1,
            JobStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed) + 1,
            JobStatus::Pending | JobStatus::Running => return,
        };
        info!(
            target: "alldownloads::metrics",
            message = "fetch_jobs_total",
            status = %status,
            total
        );
    }

    fn product_versions(&self, product_id: &str, count: usize) {
        info!(
            target: "alldownloads::metrics",
            message = "product_versions",
            product_id,
            count
        );
    }

    fn queue_gauges(&self, depth: u64, processing: u64) {
        info!(
            target: "alldownloads::metrics",
            message = "queue",
            depth,
            processing
        );
    }
}

/// Keeps everything it is told, for assertions.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub finished: Vec<JobStatus>,
    pub versions: HashMap<String, usize>,
    pub gauges: Vec<(u64, u64)>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        self.lock().clone()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.lock().finished.iter().filter(|s| **s == status).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsSink for RecordingMetrics {
    fn job_finished(&self, status: JobStatus) {
        self.lock().finished.push(status);
    }

    fn product_versions(&self, product_id: &str, count: usize) {
        self.lock().versions.insert(product_id.to_owned(), count);
    }

    fn queue_gauges(&self, depth: u64, processing: u64) {
        self.lock().gauges.push((depth, processing));
    }
}
