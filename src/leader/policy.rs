//! Retry and worker-failure policies
//!
//! The leader asks the policy two questions: should this failed test go back
//! to the queue, and can the run survive this worker failing. Both are
//! answered from the transported failure chains only.

use std::collections::HashMap;

use distrib_protocol::record::failures_of;
use distrib_protocol::{FailureRecord, TestEvent};

use crate::config::{PolicyKind, RetryConfig};

/// Decides retries and tolerated worker failures.
///
/// Always called under the leader's reporting lock, so implementations may
/// keep plain mutable state.
pub trait ErrorPolicy: Send {
    /// Whether `test` should be retried given its events and terminal exception.
    fn retry_test(&mut self, test: &str, events: &[TestEvent], exception: Option<&FailureRecord>) -> bool;

    /// Whether the run can go on after a worker failed with `exception`.
    fn ignore_worker_failure(&mut self, exception: Option<&FailureRecord>) -> bool;

    /// Worker failures seen so far
    fn failed_workers_count(&self) -> u32;
}

/// Build the policy selected by `retry.policy`.
pub fn policy_for(config: &RetryConfig) -> Box<dyn ErrorPolicy> {
    match config.policy {
        PolicyKind::Default => Box::new(DefaultPolicy::new(config)),
        PolicyKind::RepeatedFailureLimited => Box::new(RepeatedFailurePolicy::new(config)),
    }
}

fn collect_failures<'a>(events: &'a [TestEvent], exception: Option<&'a FailureRecord>) -> Vec<&'a FailureRecord> {
    let mut failures = failures_of(events);
    failures.extend(exception);
    failures
}

/// Retries up to `retry_attempts` times when every failure is allow-listed.
#[derive(Debug)]
pub struct DefaultPolicy {
    retry_attempts: u32,
    retryable: Vec<String>,
    fatal: Vec<String>,
    failed_workers_threshold: u32,
    retries: HashMap<String, u32>,
    failed_workers: u32,
}

impl DefaultPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            retryable: config.retryable_exceptions.clone(),
            fatal: config.fatal_worker_failures.clone(),
            failed_workers_threshold: config.failed_workers_threshold,
            retries: HashMap::new(),
            failed_workers: 0,
        }
    }

    /// Retries granted to `test` so far
    pub fn retries_of(&self, test: &str) -> u32 {
        self.retries.get(test).copied().unwrap_or(0)
    }

    fn is_retryable(&self, failures: &[&FailureRecord]) -> bool {
        if failures.is_empty() {
            return false;
        }
        if self.retryable.is_empty() {
            return true;
        }
        failures.iter().all(|failure| failure.has_class_in(&self.retryable))
    }
}

impl ErrorPolicy for DefaultPolicy {
    fn retry_test(&mut self, test: &str, events: &[TestEvent], exception: Option<&FailureRecord>) -> bool {
        if self.retries_of(test) >= self.retry_attempts {
            return false;
        }

        let failures = collect_failures(events, exception);
        if !self.is_retryable(&failures) {
            return false;
        }

        *self.retries.entry(test.to_string()).or_insert(0) += 1;
        true
    }

    fn ignore_worker_failure(&mut self, exception: Option<&FailureRecord>) -> bool {
        self.failed_workers += 1;

        let Some(exception) = exception else {
            return false;
        };
        if self.failed_workers > self.failed_workers_threshold {
            return false;
        }
        !exception.has_class_in(&self.fatal)
    }

    fn failed_workers_count(&self) -> u32 {
        self.failed_workers
    }
}

/// [`DefaultPolicy`] that also refuses to retry a test failing the same way
/// `repeated_error_limit` times.
#[derive(Debug)]
pub struct RepeatedFailurePolicy {
    inner: DefaultPolicy,
    repeated_error_limit: u32,
    /// test -> (class, message) of every link in every failure chain -> occurrences
    seen: HashMap<String, HashMap<(String, String), u32>>,
}

impl RepeatedFailurePolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            inner: DefaultPolicy::new(config),
            repeated_error_limit: config.repeated_error_limit,
            seen: HashMap::new(),
        }
    }

    /// Signatures of every link of every failure, outer errors and causes alike
    fn signatures(failures: &[&FailureRecord]) -> Vec<(String, String)> {
        failures
            .iter()
            .flat_map(|failure| failure.chain())
            .map(|link| (link.class_name.clone(), link.message.clone()))
            .collect()
    }
}

impl ErrorPolicy for RepeatedFailurePolicy {
    fn retry_test(&mut self, test: &str, events: &[TestEvent], exception: Option<&FailureRecord>) -> bool {
        let signatures = Self::signatures(&collect_failures(events, exception));

        if let Some(history) = self.seen.get(test) {
            let repeated = signatures
                .iter()
                .any(|signature| history.get(signature).copied().unwrap_or(0) >= self.repeated_error_limit);
            if repeated {
                return false;
            }
        }

        if !self.inner.retry_test(test, events, exception) {
            return false;
        }

        let history = self.seen.entry(test.to_string()).or_default();
        for signature in signatures {
            *history.entry(signature).or_insert(0) += 1;
        }
        true
    }

    fn ignore_worker_failure(&mut self, exception: Option<&FailureRecord>) -> bool {
        self.inner.ignore_worker_failure(exception)
    }

    fn failed_workers_count(&self) -> u32 {
        self.inner.failed_workers_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distrib_protocol::TestStatus;

    fn config(retry_attempts: u32, retryable: &[&str]) -> RetryConfig {
        RetryConfig {
            retry_attempts,
            retryable_exceptions: retryable.iter().map(|s| s.to_string()).collect(),
            ..RetryConfig::default()
        }
    }

    fn failed_with(class: &str, message: &str) -> Vec<TestEvent> {
        vec![TestEvent::finished(TestStatus::Failed).with_failure(FailureRecord::new(class, message))]
    }

    #[test]
    fn test_retried_once_then_not() {
        let mut policy = DefaultPolicy::new(&config(1, &["FooError"]));
        let events = failed_with("FooError", "boom");

        assert!(policy.retry_test("t", &events, None));
        assert!(!policy.retry_test("t", &events, None));
        assert_eq!(policy.retries_of("t"), 1);
    }

    #[test]
    fn test_budget_is_per_test() {
        let mut policy = DefaultPolicy::new(&config(1, &[]));
        let events = failed_with("AnyError", "x");

        assert!(policy.retry_test("a", &events, None));
        assert!(policy.retry_test("b", &events, None));
    }

    #[test]
    fn test_no_failures_no_retry() {
        let mut policy = DefaultPolicy::new(&config(3, &[]));
        let events = vec![TestEvent::finished(TestStatus::Passed)];
        assert!(!policy.retry_test("t", &events, None));
        assert_eq!(policy.retries_of("t"), 0);
    }

    #[test]
    fn test_pending_failures_ignored() {
        let mut policy = DefaultPolicy::new(&config(3, &[]));
        let events =
            vec![TestEvent::finished(TestStatus::Pending).with_failure(FailureRecord::new("Pending", "later"))];
        assert!(!policy.retry_test("t", &events, None));
    }

    #[test]
    fn test_every_failure_must_be_allow_listed() {
        let mut policy = DefaultPolicy::new(&config(3, &["FooError"]));
        let mut events = failed_with("FooError", "a");
        events.extend(failed_with("BarError", "b"));

        assert!(!policy.retry_test("t", &events, None));
    }

    #[test]
    fn test_allow_listed_cause_counts() {
        let mut policy = DefaultPolicy::new(&config(3, &["Net::ReadTimeout"]));
        let wrapped = FailureRecord::new("RuntimeError", "request failed").caused_by("Net::ReadTimeout", "slow");
        let events = vec![TestEvent::finished(TestStatus::Failed).with_failure(wrapped)];

        assert!(policy.retry_test("t", &events, None));
    }

    #[test]
    fn test_terminal_exception_counts_as_failure() {
        let mut policy = DefaultPolicy::new(&config(1, &["FooError"]));
        let exception = FailureRecord::new("FooError", "crashed");

        assert!(policy.retry_test("t", &[], Some(&exception)));
    }

    #[test]
    fn test_failed_workers_threshold() {
        let mut policy = DefaultPolicy::new(&RetryConfig {
            failed_workers_threshold: 1,
            ..RetryConfig::default()
        });
        let exception = FailureRecord::new("LoadError", "cannot load");

        assert!(policy.ignore_worker_failure(Some(&exception)));
        assert!(!policy.ignore_worker_failure(Some(&exception)));
        assert_eq!(policy.failed_workers_count(), 2);
    }

    #[test]
    fn test_missing_exception_not_ignored() {
        let mut policy = DefaultPolicy::new(&RetryConfig {
            failed_workers_threshold: 5,
            ..RetryConfig::default()
        });
        assert!(!policy.ignore_worker_failure(None));
        assert_eq!(policy.failed_workers_count(), 1);
    }

    #[test]
    fn test_fatal_worker_failure_class() {
        let mut policy = DefaultPolicy::new(&RetryConfig {
            failed_workers_threshold: 5,
            fatal_worker_failures: vec!["NoMemoryError".to_string()],
            ..RetryConfig::default()
        });
        let fatal = FailureRecord::new("RuntimeError", "boot").caused_by("NoMemoryError", "oom");

        assert!(!policy.ignore_worker_failure(Some(&fatal)));
    }

    #[test]
    fn test_repeated_failure_refused() {
        let mut policy = RepeatedFailurePolicy::new(&RetryConfig {
            policy: PolicyKind::RepeatedFailureLimited,
            retry_attempts: 5,
            repeated_error_limit: 1,
            ..RetryConfig::default()
        });

        assert!(policy.retry_test("t", &failed_with("FooError", "x"), None));
        assert!(!policy.retry_test("t", &failed_with("FooError", "x"), None));
        assert!(policy.retry_test("t", &failed_with("FooError", "y"), None));
    }

    #[test]
    fn test_repeated_inner_cause_refused() {
        let mut policy = RepeatedFailurePolicy::new(&RetryConfig {
            policy: PolicyKind::RepeatedFailureLimited,
            retry_attempts: 5,
            repeated_error_limit: 1,
            ..RetryConfig::default()
        });
        let attempt = |i: u32| {
            let failure = FailureRecord::new("RuntimeError", format!("request {} failed", i))
                .caused_by("Net::ReadTimeout", "execution expired");
            vec![TestEvent::finished(TestStatus::Failed).with_failure(failure)]
        };

        let retried = (0..5).filter(|i| policy.retry_test("t", &attempt(*i), None)).count();
        assert_eq!(retried, 1);
        assert_eq!(policy.inner.retries_of("t"), 1);
    }

    #[test]
    fn test_repeated_failure_limit_counts_occurrences() {
        let mut policy = RepeatedFailurePolicy::new(&RetryConfig {
            policy: PolicyKind::RepeatedFailureLimited,
            retry_attempts: 5,
            repeated_error_limit: 2,
            ..RetryConfig::default()
        });
        let wrapped = || {
            let failure = FailureRecord::new("RuntimeError", "wrapper").caused_by("FooError", "inner");
            vec![TestEvent::finished(TestStatus::Failed).with_failure(failure)]
        };

        assert!(policy.retry_test("t", &wrapped(), None));
        assert!(policy.retry_test("t", &wrapped(), None));
        assert!(!policy.retry_test("t", &wrapped(), None));
    }

    #[test]
    fn test_repeated_failure_respects_allow_list() {
        let mut policy = policy_for(&RetryConfig {
            policy: PolicyKind::RepeatedFailureLimited,
            retry_attempts: 5,
            retryable_exceptions: vec!["FooError".to_string()],
            ..RetryConfig::default()
        });

        assert!(!policy.retry_test("t", &failed_with("BarError", "x"), None));
        assert!(policy.retry_test("t", &failed_with("FooError", "x"), None));
    }
}
