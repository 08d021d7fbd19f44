//! Console reporter

use std::io::{self, Write};

use distrib_protocol::{FailureRecord, TestEvent, TestStatus};

use crate::leader::{Reporter, RunSummary};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    passed: usize,
    failed: usize,
    pending: usize,
    retried: usize,
}

/// Prints one line per finished test and a summary at the end
pub struct ConsoleReporter<W> {
    out: W,
    counts: Counts,
    failures: Vec<(String, Option<FailureRecord>)>,
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            counts: Counts::default(),
            failures: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.out, "{}", text) {
            tracing::debug!(error = %e, "failed to write report");
        }
    }

    fn chain(&mut self, failure: &FailureRecord) {
        for (depth, link) in failure.chain().iter().enumerate() {
            let prefix = if depth == 0 { "" } else { "caused by " };
            self.line(format_args!("     {}{}: {}", prefix, link.class_name, link.message));
        }
    }
}

fn status_of(events: &[TestEvent]) -> TestStatus {
    let statuses: Vec<TestStatus> = events.iter().filter_map(|e| e.status).collect();
    if statuses.contains(&TestStatus::Failed) {
        TestStatus::Failed
    } else if !statuses.is_empty() && statuses.iter().all(|s| matches!(s, TestStatus::Pending | TestStatus::Skipped)) {
        TestStatus::Pending
    } else {
        TestStatus::Passed
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn run_started(&mut self, total: usize) {
        self.line(format_args!("Running {} tests", total));
    }

    fn report_test(&mut self, test: &str, events: &[TestEvent]) {
        match status_of(events) {
            TestStatus::Failed => {
                self.counts.failed += 1;
                let failure = events.iter().find_map(|e| e.failure.clone());
                self.line(format_args!("FAIL    {}", test));
                self.failures.push((test.to_string(), failure));
            }
            TestStatus::Pending | TestStatus::Skipped => {
                self.counts.pending += 1;
                self.line(format_args!("PENDING {}", test));
            }
            TestStatus::Passed => {
                self.counts.passed += 1;
                self.line(format_args!("PASS    {}", test));
            }
        }
    }

    fn report_retrying(&mut self, test: &str, _events: &[TestEvent]) {
        self.counts.retried += 1;
        self.line(format_args!("RETRY   {}", test));
    }

    fn report_non_test_failure(&mut self, exception: &FailureRecord, context: &str) {
        if context.is_empty() {
            self.line(format_args!("ERROR   outside of tests"));
        } else {
            self.line(format_args!("ERROR   {}", context));
        }
        self.chain(exception);
    }

    fn run_finished(&mut self, summary: &RunSummary) {
        let failures = std::mem::take(&mut self.failures);
        if !failures.is_empty() {
            self.line(format_args!("\nFailures:"));
            for (index, (test, failure)) in failures.iter().enumerate() {
                self.line(format_args!("  {}) {}", index + 1, test));
                if let Some(failure) = failure {
                    self.chain(failure);
                }
            }
        }
        self.failures = failures;

        let counts = self.counts;
        self.line(format_args!(
            "\n{} passed, {} failed, {} pending, {} retried; {} of {} tests completed",
            counts.passed,
            counts.failed,
            counts.pending,
            counts.retried,
            summary.completed,
            summary.completed + summary.outstanding
        ));
    }

    fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }
}
