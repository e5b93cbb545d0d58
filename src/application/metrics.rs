//! Observability counters for the adapter.
//!
//! Tracks how much remote traffic the cache and the aggregator absorb, and
//! how much telemetry is lost to failed flushes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters shared by the check processor and the report builder.
///
/// All counters use relaxed atomics; readers get a consistent value per
/// counter, not a consistent cut across counters.
#[derive(Debug, Clone, Default)]
pub struct AdapterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    remote_checks: AtomicU64,
    coalesced_waits: AtomicU64,
    quota_allocations: AtomicU64,
    denials: AtomicU64,
    remote_failures: AtomicU64,
    instances_ingested: AtomicU64,
    instances_rejected: AtomicU64,
    batches_sent: AtomicU64,
    batches_retried: AtomicU64,
    batches_dropped: AtomicU64,
    value_sets_dropped: AtomicU64,
}

impl AdapterMetrics {
    /// Create a new set of zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_check(&self) {
        self.inner.remote_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced_wait(&self) {
        self.inner.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_quota_allocation(&self) {
        self.inner.quota_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denial(&self) {
        self.inner.denials.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_failure(&self) {
        self.inner.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ingested(&self, count: u64) {
        self.inner
            .instances_ingested
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self, count: u64) {
        self.inner
            .instances_rejected
            .fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_sent(&self) {
        self.inner.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_retried(&self) {
        self.inner.batches_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch dropped after exhausting its retries.
    pub(crate) fn record_batch_dropped(&self, value_sets: u64) {
        self.inner.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.inner
            .value_sets_dropped
            .fetch_add(value_sets, Ordering::Relaxed);
    }

    /// Decisions served from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.inner.cache_hits.load(Ordering::Relaxed)
    }

    /// Evaluations that found no fresh cache entry.
    pub fn cache_misses(&self) -> u64 {
        self.inner.cache_misses.load(Ordering::Relaxed)
    }

    /// Remote Check calls issued.
    pub fn remote_checks(&self) -> u64 {
        self.inner.remote_checks.load(Ordering::Relaxed)
    }

    /// Callers that joined an exchange already in flight.
    pub fn coalesced_waits(&self) -> u64 {
        self.inner.coalesced_waits.load(Ordering::Relaxed)
    }

    /// Remote AllocateQuota calls issued.
    pub fn quota_allocations(&self) -> u64 {
        self.inner.quota_allocations.load(Ordering::Relaxed)
    }

    /// Deny decisions produced by remote exchanges.
    pub fn denials(&self) -> u64 {
        self.inner.denials.load(Ordering::Relaxed)
    }

    /// Remote exchanges that failed transiently.
    pub fn remote_failures(&self) -> u64 {
        self.inner.remote_failures.load(Ordering::Relaxed)
    }

    /// Metric instances folded into accumulators.
    pub fn instances_ingested(&self) -> u64 {
        self.inner.instances_ingested.load(Ordering::Relaxed)
    }

    /// Metric instances rejected during ingest.
    pub fn instances_rejected(&self) -> u64 {
        self.inner.instances_rejected.load(Ordering::Relaxed)
    }

    /// Report batches accepted by the remote service.
    pub fn batches_sent(&self) -> u64 {
        self.inner.batches_sent.load(Ordering::Relaxed)
    }

    /// Report attempts repeated after a failure.
    pub fn batches_retried(&self) -> u64 {
        self.inner.batches_retried.load(Ordering::Relaxed)
    }

    /// Report batches dropped after exhausting retries.
    pub fn batches_dropped(&self) -> u64 {
        self.inner.batches_dropped.load(Ordering::Relaxed)
    }

    /// Metric value sets lost with dropped batches.
    pub fn value_sets_dropped(&self) -> u64 {
        self.inner.value_sets_dropped.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            remote_checks: self.remote_checks(),
            coalesced_waits: self.coalesced_waits(),
            quota_allocations: self.quota_allocations(),
            denials: self.denials(),
            remote_failures: self.remote_failures(),
            instances_ingested: self.instances_ingested(),
            instances_rejected: self.instances_rejected(),
            batches_sent: self.batches_sent(),
            batches_retried: self.batches_retried(),
            batches_dropped: self.batches_dropped(),
            value_sets_dropped: self.value_sets_dropped(),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.cache_hits,
            &inner.cache_misses,
            &inner.remote_checks,
            &inner.coalesced_waits,
            &inner.quota_allocations,
            &inner.denials,
            &inner.remote_failures,
            &inner.instances_ingested,
            &inner.instances_rejected,
            &inner.batches_sent,
            &inner.batches_retried,
            &inner.batches_dropped,
            &inner.value_sets_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of the adapter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Decisions served from the cache
    pub cache_hits: u64,
    /// Evaluations that found no fresh cache entry
    pub cache_misses: u64,
    /// Remote Check calls issued
    pub remote_checks: u64,
    /// Callers that joined an exchange already in flight
    pub coalesced_waits: u64,
    /// Remote AllocateQuota calls issued
    pub quota_allocations: u64,
    /// Deny decisions produced by remote exchanges
    pub denials: u64,
    /// Remote exchanges that failed transiently
    pub remote_failures: u64,
    /// Metric instances folded into accumulators
    pub instances_ingested: u64,
    /// Metric instances rejected during ingest
    pub instances_rejected: u64,
    /// Report batches accepted by the remote service
    pub batches_sent: u64,
    /// Report attempts repeated after a failure
    pub batches_retried: u64,
    /// Report batches dropped after exhausting retries
    pub batches_dropped: u64,
    /// Metric value sets lost with dropped batches
    pub value_sets_dropped: u64,
}

impl MetricsSnapshot {
    /// Fraction of evaluations answered without a remote call (0.0 to 1.0).
    ///
    /// Coalesced waiters count as hits since they did not issue a call.
    /// Returns 0.0 if nothing has been evaluated.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits.saturating_add(self.cache_misses);
        if total == 0 {
            0.0
        } else {
            let absorbed = self.cache_hits.saturating_add(self.coalesced_waits);
            absorbed.min(total) as f64 / total as f64
        }
    }

    /// Total evaluations seen (hits + misses).
    pub fn total_evaluations(&self) -> u64 {
        self.cache_hits.saturating_add(self.cache_misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_state() {
        let metrics = AdapterMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot() {
        let metrics = AdapterMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_remote_check();
        metrics.record_ingested(5);
        metrics.record_rejected(2);
        metrics.record_batch_dropped(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.remote_checks, 1);
        assert_eq!(snapshot.instances_ingested, 5);
        assert_eq!(snapshot.instances_rejected, 2);
        assert_eq!(snapshot.batches_dropped, 1);
        assert_eq!(snapshot.value_sets_dropped, 7);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = AdapterMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);

        metrics.record_cache_miss();
        assert_eq!(metrics.snapshot().cache_hit_rate(), 0.0);

        metrics.record_cache_hit();
        assert!((metrics.snapshot().cache_hit_rate() - 0.5).abs() < f64::EPSILON);

        // A second miss that joined an existing flight is absorbed too.
        metrics.record_cache_miss();
        metrics.record_coalesced_wait();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_evaluations(), 3);
        assert!((snapshot.cache_hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset() {
        let metrics = AdapterMetrics::new();
        metrics.record_denial();
        metrics.record_batch_sent();
        metrics.record_batch_retried();

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_metrics_clone_shares_counters() {
        let metrics1 = AdapterMetrics::new();
        metrics1.record_quota_allocation();

        let metrics2 = metrics1.clone();
        metrics2.record_quota_allocation();

        assert_eq!(metrics1.quota_allocations(), 2);
        assert_eq!(metrics2.quota_allocations(), 2);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::thread;

        let metrics = AdapterMetrics::new();
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.record_cache_hit();
                    m.record_ingested(2);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.cache_hits(), 1000);
        assert_eq!(metrics.instances_ingested(), 2000);
    }
}
