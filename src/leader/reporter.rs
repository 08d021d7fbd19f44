//! Reporter interface
//!
//! The leader forwards every final result batch to a reporter. Calls are
//! serialized by the leader, so a batch is never interleaved with another.

use std::sync::Arc;

use distrib_protocol::{FailureRecord, TestEvent, TestStatus};
use parking_lot::Mutex;

/// Totals handed to [`Reporter::run_finished`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub outstanding: usize,
    pub failed: bool,
}

pub trait Reporter: Send {
    /// First worker asked for a test
    fn run_started(&mut self, total: usize) {
        let _ = total;
    }

    /// Final result batch of a test
    fn report_test(&mut self, test: &str, events: &[TestEvent]);

    /// Failed batch of a test that goes back to the queue
    fn report_retrying(&mut self, test: &str, events: &[TestEvent]) {
        let _ = (test, events);
    }

    /// A worker failed outside any test, e.g. while loading test files.
    /// `context` says what it was doing.
    fn report_non_test_failure(&mut self, exception: &FailureRecord, context: &str) {
        let _ = (exception, context);
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let _ = summary;
    }

    /// Whether any reported test failed
    fn has_failures(&self) -> bool;
}

/// A test as seen by [`CollectingReporter`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedTest {
    pub test: String,
    pub events: Vec<TestEvent>,
    pub retrying: bool,
}

#[derive(Debug, Default)]
struct Collected {
    started: Option<usize>,
    started_calls: usize,
    reports: Vec<ReportedTest>,
    non_test_failures: Vec<(FailureRecord, String)>,
    summary: Option<RunSummary>,
}

/// Reporter keeping everything in memory.
///
/// Clones share the same storage, so a copy can be inspected after the
/// leader consumed the original.
#[derive(Debug, Clone, Default)]
pub struct CollectingReporter {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total announced by `run_started`
    pub fn started(&self) -> Option<usize> {
        self.inner.lock().started
    }

    /// How many times `run_started` was called
    pub fn started_calls(&self) -> usize {
        self.inner.lock().started_calls
    }

    /// Failures outside tests with their context
    pub fn non_test_failures(&self) -> Vec<(FailureRecord, String)> {
        self.inner.lock().non_test_failures.clone()
    }

    /// Final results, in report order
    pub fn finished(&self) -> Vec<ReportedTest> {
        self.inner
            .lock()
            .reports
            .iter()
            .filter(|r| !r.retrying)
            .cloned()
            .collect()
    }

    /// Everything reported, retries included
    pub fn reports(&self) -> Vec<ReportedTest> {
        self.inner.lock().reports.clone()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.inner.lock().summary
    }

    fn push(&self, test: &str, events: &[TestEvent], retrying: bool) {
        self.inner.lock().reports.push(ReportedTest {
            test: test.to_string(),
            events: events.to_vec(),
            retrying,
        });
    }
}

impl Reporter for CollectingReporter {
    fn run_started(&mut self, total: usize) {
        let mut inner = self.inner.lock();
        inner.started = Some(total);
        inner.started_calls += 1;
    }

    fn report_test(&mut self, test: &str, events: &[TestEvent]) {
        self.push(test, events, false);
    }

    fn report_retrying(&mut self, test: &str, events: &[TestEvent]) {
        self.push(test, events, true);
    }

    fn report_non_test_failure(&mut self, exception: &FailureRecord, context: &str) {
        self.inner
            .lock()
            .non_test_failures
            .push((exception.clone(), context.to_string()));
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        self.inner.lock().summary = Some(*summary);
    }

    fn has_failures(&self) -> bool {
        self.inner
            .lock()
            .reports
            .iter()
            .filter(|r| !r.retrying)
            .any(|r| r.events.iter().any(|e| e.status == Some(TestStatus::Failed)))
    }
}
