//! In-process counters and histograms for the pipeline.
//!
//! The host's exporter scrapes [`Metrics::snapshot`]; inside the crate the
//! same atomics double as the autoscaler's backpressure signals (queue
//! depth, idle ratio). All counters are plain relaxed atomics; nothing here
//! takes a lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Log-scale histogram of match execution wall times.
///
/// Bucket `i` counts durations below `2^i` milliseconds; the last bucket is
/// the overflow. Fixed size keeps it allocation-free and scrape-friendly.
#[derive(Debug, Default)]
pub struct DurationHistogram {
    buckets: [AtomicU64; Self::BUCKETS],
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    const BUCKETS: usize = 18; // up to ~131 s, then overflow

    /// Record one duration.
    pub fn observe(&self, d: Duration) {
        let millis = d.as_millis() as u64;
        let idx = (64 - millis.leading_zeros() as usize).min(Self::BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_millis.fetch_add(millis, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Observations recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observed duration, `None` before the first observation.
    pub fn mean(&self) -> Option<Duration> {
        let n = self.count();
        if n == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.sum_millis.load(Ordering::Relaxed) / n,
        ))
    }

    /// Per-bucket counts, smallest magnitude first.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Shared counters for the whole engine. One instance, `Arc`-shared.
#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) matches_processed: AtomicU64,
    pub(crate) matches_failed: AtomicU64,
    pub(crate) matches_requeued: AtomicU64,
    pub(crate) worker_panics: AtomicU64,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) idle_workers: AtomicUsize,
    pub(crate) queue_depth: AtomicUsize,
    pub(crate) execution_times: DurationHistogram,
}

impl Metrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_processed(&self, d: Duration) {
        self.matches_processed.fetch_add(1, Ordering::Relaxed);
        self.execution_times.observe(d);
    }

    pub(crate) fn record_failed(&self) {
        self.matches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self) {
        self.matches_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of live workers currently blocked on dequeue.
    pub fn idle_ratio(&self) -> f64 {
        let active = self.active_workers.load(Ordering::Relaxed);
        if active == 0 {
            return 0.0;
        }
        self.idle_workers.load(Ordering::Relaxed) as f64 / active as f64
    }

    /// Consistent-enough point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            matches_processed: self.matches_processed.load(Ordering::Relaxed),
            matches_failed: self.matches_failed.load(Ordering::Relaxed),
            matches_requeued: self.matches_requeued.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            mean_execution: self.execution_times.mean(),
            execution_buckets: self.execution_times.bucket_counts(),
        }
    }
}

/// Point-in-time view of [`Metrics`], cheap to serialize by the host.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Outcomes applied as completed.
    pub matches_processed: u64,
    /// Outcomes applied as failed.
    pub matches_failed: u64,
    /// Transient faults sent back to the queue.
    pub matches_requeued: u64,
    /// Panics caught inside worker loops.
    pub worker_panics: u64,
    /// Worker threads currently alive.
    pub active_workers: usize,
    /// Ready items across all lanes at the last controller tick.
    pub queue_depth: usize,
    /// Mean execution wall time, if anything ran yet.
    pub mean_execution: Option<Duration>,
    /// Execution-time histogram buckets.
    pub execution_buckets: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_magnitude() {
        let h = DurationHistogram::default();
        h.observe(Duration::from_millis(3));
        h.observe(Duration::from_millis(900));
        h.observe(Duration::from_secs(200)); // overflow bucket
        assert_eq!(h.count(), 3);
        let buckets = h.bucket_counts();
        assert_eq!(buckets[2], 1); // 3 ms < 2^2=4
        assert_eq!(buckets[10], 1); // 900 ms < 2^10=1024
        assert_eq!(buckets[DurationHistogram::BUCKETS - 1], 1);
    }

    #[test]
    fn idle_ratio_is_zero_without_workers() {
        let m = Metrics::new();
        assert_eq!(m.idle_ratio(), 0.0);
        m.active_workers.store(4, Ordering::Relaxed);
        m.idle_workers.store(2, Ordering::Relaxed);
        assert!((m.idle_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
