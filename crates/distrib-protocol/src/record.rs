//! Transportable test results.
//!
//! Workers never send live error values to the leader. A failure is flattened
//! at the point where it happened into an ordered chain: the outer error
//! first, then each wrapped cause, innermost last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One link of a failure chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Class (type) name of the error as the test framework reported it.
    pub class_name: String,
    /// Error message.
    pub message: String,
    /// Backtrace lines, outermost frame first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl ExceptionInfo {
    /// Create a link without backtrace.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }
}

/// Returned when decoding a failure record without any link.
#[derive(Debug, thiserror::Error)]
#[error("failure record must contain at least one exception")]
pub struct EmptyChainError;

/// An error and its causes, `[outer, cause, ..., innermost]`.
///
/// Always holds at least one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ExceptionInfo>", into = "Vec<ExceptionInfo>")]
pub struct FailureRecord {
    chain: Vec<ExceptionInfo>,
}

impl FailureRecord {
    /// Create a record holding a single error.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            chain: vec![ExceptionInfo::new(class_name, message)],
        }
    }

    /// Attach a backtrace to the outer error.
    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.chain[0].backtrace = backtrace;
        self
    }

    /// Append a cause below the current innermost link.
    pub fn caused_by(mut self, class_name: impl Into<String>, message: impl Into<String>) -> Self {
        self.chain.push(ExceptionInfo::new(class_name, message));
        self
    }

    /// The outer error.
    pub fn outer(&self) -> &ExceptionInfo {
        &self.chain[0]
    }

    /// Class name of the outer error.
    pub fn class_name(&self) -> &str {
        &self.outer().class_name
    }

    /// Message of the outer error.
    pub fn message(&self) -> &str {
        &self.outer().message
    }

    /// The whole chain, outer first.
    pub fn chain(&self) -> &[ExceptionInfo] {
        &self.chain
    }

    /// Whether any link of the chain has one of the given class names.
    pub fn has_class_in(&self, classes: &[String]) -> bool {
        self.chain
            .iter()
            .any(|link| classes.iter().any(|class| class == &link.class_name))
    }

    /// First link whose class is one of the given class names.
    pub fn find_class_in(&self, classes: &[String]) -> Option<&ExceptionInfo> {
        self.chain
            .iter()
            .find(|link| classes.iter().any(|class| class == &link.class_name))
    }
}

impl TryFrom<Vec<ExceptionInfo>> for FailureRecord {
    type Error = EmptyChainError;

    fn try_from(chain: Vec<ExceptionInfo>) -> Result<Self, Self::Error> {
        if chain.is_empty() {
            return Err(EmptyChainError);
        }
        Ok(Self { chain })
    }
}

impl From<FailureRecord> for Vec<ExceptionInfo> {
    fn from(record: FailureRecord) -> Self {
        record.chain
    }
}

/// Outcome of a single test case inside a test file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Pending,
    Skipped,
}

/// A timestamped result event emitted while executing a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    /// Event name (e.g. "test_case_started", "test_case_finished").
    pub name: String,
    /// When the event was emitted on the worker.
    pub at: DateTime<Utc>,
    /// Outcome, for events that conclude a test case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
    /// Failure attached to the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Free-form data for reporters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TestEvent {
    /// Create an event stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            at: Utc::now(),
            status: None,
            failure: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a "test_case_finished" event with the given outcome.
    pub fn finished(status: TestStatus) -> Self {
        Self::new("test_case_finished").with_status(status)
    }

    pub fn with_status(mut self, status: TestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_failure(mut self, failure: FailureRecord) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether this event reports a failed test case.
    pub fn is_failure(&self) -> bool {
        self.status == Some(TestStatus::Failed)
    }
}

/// Failures carried by a batch of events.
///
/// Pending and skipped cases may carry a failure describing why they did not
/// run; those are not failures of the test.
pub fn failures_of(events: &[TestEvent]) -> Vec<&FailureRecord> {
    events
        .iter()
        .filter(|event| !matches!(event.status, Some(TestStatus::Pending | TestStatus::Skipped)))
        .filter_map(|event| event.failure.as_ref())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_outer_first() {
        let record = FailureRecord::new("RuntimeError", "wrapper")
            .caused_by("Net::ReadTimeout", "timed out")
            .caused_by("Errno::ECONNRESET", "reset");

        let classes: Vec<&str> = record.chain().iter().map(|l| l.class_name.as_str()).collect();
        assert_eq!(classes, vec!["RuntimeError", "Net::ReadTimeout", "Errno::ECONNRESET"]);
        assert_eq!(record.class_name(), "RuntimeError");
    }

    #[test]
    fn test_chain_serializes_as_list() {
        let record = FailureRecord::new("FooError", "boom").caused_by("BarError", "inner");
        let value = serde_json::to_value(&record).unwrap();

        assert!(value.is_array());
        assert_eq!(value[0]["class_name"], "FooError");
        assert_eq!(value[1]["message"], "inner");
    }

    #[test]
    fn test_empty_chain_rejected() {
        let result: Result<FailureRecord, _> = serde_json::from_str("[]");
        assert!(result.is_err());
    }

    #[test]
    fn test_has_class_in_checks_causes() {
        let record = FailureRecord::new("RuntimeError", "wrapper").caused_by("FooError", "inner");
        assert!(record.has_class_in(&["FooError".to_string()]));
        assert!(!record.has_class_in(&["BarError".to_string()]));
        assert_eq!(
            record.find_class_in(&["FooError".to_string()]).map(|l| l.message.as_str()),
            Some("inner")
        );
    }

    #[test]
    fn test_failures_of_skips_pending() {
        let events = vec![
            TestEvent::finished(TestStatus::Passed),
            TestEvent::finished(TestStatus::Failed).with_failure(FailureRecord::new("FooError", "x")),
            TestEvent::finished(TestStatus::Pending).with_failure(FailureRecord::new("Pending", "later")),
        ];

        let failures = failures_of(&events);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].class_name(), "FooError");
    }
}
