//! Lock-free pipeline metrics and periodic reporting
//!
//! Counters are plain atomics so the capture, publish and lookup paths never
//! contend. `report()` swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering - these are statistical counters
//! only. Do NOT use them for coordination.

use crate::domain::error::CaptureError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lookup latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket holding the given percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket reports 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector shared by the pipeline services
pub struct Metrics {
    /// Codes captured successfully (monotonic)
    captures_total: AtomicU64,
    /// Captures cancelled by the operator (monotonic)
    captures_cancelled: AtomicU64,
    permission_denied: AtomicU64,
    no_code_found: AtomicU64,
    invalid_input: AtomicU64,
    scan_failures: AtomicU64,
    scan_unavailable: AtomicU64,
    /// Slot writes accepted by the session store (monotonic)
    publishes_total: AtomicU64,
    publish_failures: AtomicU64,
    /// Explicit slot clears (monotonic)
    clears_total: AtomicU64,
    clear_failures: AtomicU64,
    lookups_found: AtomicU64,
    lookups_not_found: AtomicU64,
    lookup_failures: AtomicU64,
    /// Lookup latency histogram (reset on report)
    lookup_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of lookup latencies in ms (reset on report)
    lookup_latency_sum_ms: AtomicU64,
    /// Max lookup latency in ms (reset on report)
    lookup_latency_max_ms: AtomicU64,
    /// Lookups since last report (reset on report)
    lookups_since_report: AtomicU64,
    notifications_sent: AtomicU64,
    notification_failures: AtomicU64,
    /// Requests rejected because a run was in flight (monotonic)
    busy_rejections: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures_total: AtomicU64::new(0),
            captures_cancelled: AtomicU64::new(0),
            permission_denied: AtomicU64::new(0),
            no_code_found: AtomicU64::new(0),
            invalid_input: AtomicU64::new(0),
            scan_failures: AtomicU64::new(0),
            scan_unavailable: AtomicU64::new(0),
            publishes_total: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            clears_total: AtomicU64::new(0),
            clear_failures: AtomicU64::new(0),
            lookups_found: AtomicU64::new(0),
            lookups_not_found: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            lookup_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            lookup_latency_sum_ms: AtomicU64::new(0),
            lookup_latency_max_ms: AtomicU64::new(0),
            lookups_since_report: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notification_failures: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_capture(&self) {
        self.captures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capture_cancelled(&self) {
        self.captures_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed capture under its taxonomy bucket
    #[inline]
    pub fn record_capture_failed(&self, error: &CaptureError) {
        let counter = match error {
            CaptureError::PermissionDenied => &self.permission_denied,
            CaptureError::NoCodeFound => &self.no_code_found,
            CaptureError::InvalidInput => &self.invalid_input,
            CaptureError::ScanFailure(_) => &self.scan_failures,
            CaptureError::Unavailable => &self.scan_unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_publish(&self, ok: bool) {
        if ok {
            self.publishes_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_clear(&self, ok: bool) {
        if ok {
            self.clears_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.clear_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_lookup_found(&self) {
        self.lookups_found.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lookup_not_found(&self) {
        self.lookups_not_found.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lookup_failed(&self) {
        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record catalog round-trip latency, whatever the outcome
    #[inline]
    pub fn record_lookup_latency(&self, latency_ms: u64) {
        self.lookups_since_report.fetch_add(1, Ordering::Relaxed);
        self.lookup_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.lookup_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.lookup_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_notification(&self, ok: bool) {
        if ok {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notification_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_busy_rejection(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn captures_total(&self) -> u64 {
        self.captures_total.load(Ordering::Relaxed)
    }

    pub fn publishes_total(&self) -> u64 {
        self.publishes_total.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn notification_failures(&self) -> u64 {
        self.notification_failures.load(Ordering::Relaxed)
    }

    /// Snapshot counters; periodic latency counters are reset
    pub fn report(&self) -> MetricsSummary {
        let lookups_count = self.lookups_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.lookup_latency_sum_ms.swap(0, Ordering::Relaxed);
        let max_latency = self.lookup_latency_max_ms.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.lookup_latency_buckets);

        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed.as_secs()
        };

        let capture_failures = self.permission_denied.load(Ordering::Relaxed)
            + self.no_code_found.load(Ordering::Relaxed)
            + self.invalid_input.load(Ordering::Relaxed)
            + self.scan_failures.load(Ordering::Relaxed)
            + self.scan_unavailable.load(Ordering::Relaxed);

        MetricsSummary {
            interval_secs: elapsed_secs,
            captures_total: self.captures_total.load(Ordering::Relaxed),
            captures_cancelled: self.captures_cancelled.load(Ordering::Relaxed),
            capture_failures,
            permission_denied: self.permission_denied.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            publishes_total: self.publishes_total.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            clears_total: self.clears_total.load(Ordering::Relaxed),
            clear_failures: self.clear_failures.load(Ordering::Relaxed),
            lookups_found: self.lookups_found.load(Ordering::Relaxed),
            lookups_not_found: self.lookups_not_found.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            lookup_avg_ms: if lookups_count > 0 { latency_sum / lookups_count } else { 0 },
            lookup_max_ms: max_latency,
            lookup_p50_ms: percentile_from_buckets(&lat_buckets, 0.50),
            lookup_p95_ms: percentile_from_buckets(&lat_buckets, 0.95),
            lookup_lat_buckets: lat_buckets,
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub interval_secs: u64,
    pub captures_total: u64,
    pub captures_cancelled: u64,
    pub capture_failures: u64,
    pub permission_denied: u64,
    pub scan_failures: u64,
    pub publishes_total: u64,
    pub publish_failures: u64,
    pub clears_total: u64,
    pub clear_failures: u64,
    pub lookups_found: u64,
    pub lookups_not_found: u64,
    pub lookup_failures: u64,
    /// Average lookup latency over the interval (ms)
    pub lookup_avg_ms: u64,
    pub lookup_max_ms: u64,
    pub lookup_p50_ms: u64,
    pub lookup_p95_ms: u64,
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000 ms
    pub lookup_lat_buckets: [u64; NUM_BUCKETS],
    pub notifications_sent: u64,
    pub notification_failures: u64,
    pub busy_rejections: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            interval_secs = %self.interval_secs,
            captures = %self.captures_total,
            cancelled = %self.captures_cancelled,
            capture_failures = %self.capture_failures,
            permission_denied = %self.permission_denied,
            publishes = %self.publishes_total,
            publish_failures = %self.publish_failures,
            found = %self.lookups_found,
            not_found = %self.lookups_not_found,
            lookup_failures = %self.lookup_failures,
            lookup_avg_ms = %self.lookup_avg_ms,
            lookup_p95_ms = %self.lookup_p95_ms,
            notifications = %self.notifications_sent,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.captures_total(), 0);
        assert_eq!(metrics.publishes_total(), 0);
    }

    #[test]
    fn test_capture_failures_by_kind() {
        let metrics = Metrics::new();
        metrics.record_capture_failed(&CaptureError::PermissionDenied);
        metrics.record_capture_failed(&CaptureError::InvalidInput);
        metrics.record_capture_failed(&CaptureError::ScanFailure("boom".into()));

        let summary = metrics.report();
        assert_eq!(summary.capture_failures, 3);
        assert_eq!(summary.permission_denied, 1);
        assert_eq!(summary.scan_failures, 1);
    }

    #[test]
    fn test_report_lookup_latency() {
        let metrics = Metrics::new();
        metrics.record_lookup_latency(10);
        metrics.record_lookup_latency(20);
        metrics.record_lookup_latency(30);

        let summary = metrics.report();
        assert_eq!(summary.lookup_avg_ms, 20);
        assert_eq!(summary.lookup_max_ms, 30);
        assert_eq!(summary.lookup_lat_buckets.iter().sum::<u64>(), 3);

        // Periodic counters reset after report
        let summary = metrics.report();
        assert_eq!(summary.lookup_avg_ms, 0);
        assert_eq!(summary.lookup_max_ms, 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(5), 0);
        assert_eq!(bucket_index(6), 1);
        assert_eq!(bucket_index(5000), 9);
        assert_eq!(bucket_index(5001), 10);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 0);

        buckets[1] = 9; // ≤10ms
        buckets[6] = 1; // ≤500ms
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 10);
        assert_eq!(percentile_from_buckets(&buckets, 0.95), 500);
    }

    #[test]
    fn test_publish_and_notification_counters() {
        let metrics = Metrics::new();
        metrics.record_publish(true);
        metrics.record_publish(false);
        metrics.record_notification(false);

        assert_eq!(metrics.publishes_total(), 1);
        assert_eq!(metrics.publish_failures(), 1);
        assert_eq!(metrics.notifications_sent(), 0);
        assert_eq!(metrics.notification_failures(), 1);
    }
}
