//! Run metrics collected by the leader

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// A test the watchdog took back from a worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReclaimedTest {
    pub test: String,
    /// Timeout that expired, in seconds
    pub timeout_secs: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RunMetrics {
    queue_exposed_at: Mutex<Option<DateTime<Utc>>>,
    first_test_taken_at: Mutex<Option<DateTime<Utc>>>,
    retried: AtomicU64,
    repushed: Mutex<Vec<ReclaimedTest>>,
    released: Mutex<Vec<ReclaimedTest>>,
}

/// Point-in-time copy of [`RunMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queue_exposed_at: Option<DateTime<Utc>>,
    pub first_test_taken_at: Option<DateTime<Utc>>,
    pub retried_count: u64,
    pub watchdog_repush_count: usize,
    pub watchdog_release_count: usize,
    pub repushed_tests: Vec<ReclaimedTest>,
    pub released_tests: Vec<ReclaimedTest>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The RPC service started accepting requests
    pub fn queue_exposed(&self) {
        self.queue_exposed_at.lock().get_or_insert_with(Utc::now);
    }

    /// A worker asked for a test; only the first call is kept
    pub fn test_taken(&self) {
        self.first_test_taken_at.lock().get_or_insert_with(Utc::now);
    }

    pub fn test_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watchdog_repushed(&self, test: &str, timeout: Duration) {
        self.repushed.lock().push(reclaimed(test, timeout));
    }

    pub fn watchdog_released(&self, test: &str, timeout: Duration) {
        self.released.lock().push(reclaimed(test, timeout));
    }

    pub fn watchdog_repush_count(&self) -> usize {
        self.repushed.lock().len()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let repushed_tests = self.repushed.lock().clone();
        let released_tests = self.released.lock().clone();
        MetricsSnapshot {
            queue_exposed_at: *self.queue_exposed_at.lock(),
            first_test_taken_at: *self.first_test_taken_at.lock(),
            retried_count: self.retried.load(Ordering::Relaxed),
            watchdog_repush_count: repushed_tests.len(),
            watchdog_release_count: released_tests.len(),
            repushed_tests,
            released_tests,
        }
    }
}

fn reclaimed(test: &str, timeout: Duration) -> ReclaimedTest {
    ReclaimedTest {
        test: test.to_string(),
        timeout_secs: timeout.as_secs_f64(),
        at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_test_taken_is_kept() {
        let metrics = RunMetrics::new();
        metrics.test_taken();
        let first = metrics.snapshot().first_test_taken_at.unwrap();

        std::thread::sleep(Duration::from_millis(5));
        metrics.test_taken();
        assert_eq!(metrics.snapshot().first_test_taken_at, Some(first));
    }

    #[test]
    fn test_repush_records_timeout() {
        let metrics = RunMetrics::new();
        metrics.watchdog_repushed("spec/a_spec.rb", Duration::from_millis(1500));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.watchdog_repush_count, 1);
        assert_eq!(snapshot.repushed_tests[0].test, "spec/a_spec.rb");
        assert_eq!(snapshot.repushed_tests[0].timeout_secs, 1.5);
        assert_eq!(snapshot.watchdog_release_count, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RunMetrics::new();
        metrics.queue_exposed();
        metrics.test_retried();

        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["retried_count"], 1);
        assert!(value["queue_exposed_at"].is_string());
        assert!(value["first_test_taken_at"].is_null());
    }
}
