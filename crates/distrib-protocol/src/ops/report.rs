//! report_test, report_worker_configuration_error and notify_non_test_failure
//! operation types.

use serde::{Deserialize, Serialize};

use crate::record::{FailureRecord, TestEvent};

/// Report request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTestRequest {
    /// The test the events belong to.
    pub test: String,
    /// Ordered event batch produced while executing the test.
    pub events: Vec<TestEvent>,
    /// Failure that aborted execution outside of any single event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<FailureRecord>,
    /// Identifier of the reporting worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Report response payload.
///
/// Absent (`null` payload) when the test had already been completed and the
/// report was dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportTestResponse {
    /// Whether the test went back to the queue.
    pub will_be_retried: bool,
    /// Number of events accepted from the batch.
    pub events: usize,
}

/// Configuration error request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationErrorRequest {
    /// The failure that prevented the worker from starting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<FailureRecord>,
    /// Identifier of the reporting worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Failure raised while a worker was not inside any single test.
///
/// Loading a file with a syntax error is the usual case; it is likely to
/// break every worker, so the leader stops the run unless its policy
/// tolerates the failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonTestFailureRequest {
    pub exception: FailureRecord,
    /// What the worker was doing, may be empty
    #[serde(default)]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}
