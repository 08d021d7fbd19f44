//! Test execution interface

use distrib_protocol::ops::ProfileResponse;
use distrib_protocol::{FailureRecord, TestEvent};

/// Failure raised while running a test file but outside its test cases,
/// e.g. a syntax error while loading it
#[derive(Debug, Clone, PartialEq)]
pub struct NonTestFailure {
    pub exception: FailureRecord,
    /// What was going on, may be empty
    pub context: String,
}

/// Result of running one test
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// Events in the order they were emitted
    pub events: Vec<TestEvent>,
    /// Failure outside any single test case; makes the worker stop after reporting
    pub exception: Option<FailureRecord>,
    /// Sent to the leader before the events; the worker stops afterwards
    pub non_test_failures: Vec<NonTestFailure>,
}

impl Execution {
    pub fn new(events: Vec<TestEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    /// Execution that failed before producing events
    pub fn crashed(exception: FailureRecord) -> Self {
        Self {
            exception: Some(exception),
            ..Self::default()
        }
    }

    pub fn with_non_test_failure(mut self, exception: FailureRecord, context: impl Into<String>) -> Self {
        self.non_test_failures.push(NonTestFailure {
            exception,
            context: context.into(),
        });
        self
    }
}

/// Runs tests on a worker
pub trait TestExecutor {
    /// Apply the leader's profile before the first test.
    fn prepare(&mut self, profile: &ProfileResponse) -> Result<(), FailureRecord> {
        let _ = profile;
        Ok(())
    }

    fn execute(&mut self, test: &str) -> Execution;
}

/// Executor backed by a closure
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: FnMut(&str) -> Execution,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TestExecutor for FnExecutor<F>
where
    F: FnMut(&str) -> Execution,
{
    fn execute(&mut self, test: &str) -> Execution {
        (self.f)(test)
    }
}
